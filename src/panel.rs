use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use crate::analysis::AnalysisController;
use crate::backend::Backend;
use crate::events::EventBus;
use crate::model::{AnalysisMode, PaneMode, Target};
use crate::session::SessionController;
use crate::stream::{StreamKind, StreamRequest, StreamedOutputController};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PaneSelection {
    pub target: Target,
    pub mode: PaneMode,
    pub tail_lines: Option<u32>,
    pub follow: bool,
}

impl PaneSelection {
    pub fn exec(target: Target) -> Self {
        Self {
            target,
            mode: PaneMode::Exec,
            tail_lines: None,
            follow: false,
        }
    }

    pub fn logs(target: Target, tail_lines: Option<u32>, follow: bool) -> Self {
        Self {
            target,
            mode: PaneMode::Logs,
            tail_lines,
            follow,
        }
    }

    pub fn describe(target: Target) -> Self {
        Self {
            target,
            mode: PaneMode::Describe,
            tail_lines: None,
            follow: false,
        }
    }

    pub fn command(target: Target, command: impl Into<String>) -> Self {
        Self {
            target,
            mode: PaneMode::Command(command.into()),
            tail_lines: None,
            follow: false,
        }
    }

    fn analysis_mode(&self) -> Option<AnalysisMode> {
        match self.mode {
            PaneMode::Logs => Some(AnalysisMode::Logs),
            PaneMode::Describe => Some(AnalysisMode::Describe),
            PaneMode::Exec | PaneMode::Command(_) => None,
        }
    }
}

/// Hosts one pod's worth of controllers. Selection changes flow through
/// `reconcile`, which makes the cancel-then-start sequence one testable unit
/// instead of scattered framework teardown hooks.
pub struct PodPanel<B: Backend> {
    selection: Option<PaneSelection>,
    session: SessionController<B>,
    output: StreamedOutputController<B>,
    analysis: AnalysisController<B>,
    last_analyzed: Option<(AnalysisMode, String)>,
}

impl<B: Backend> PodPanel<B> {
    pub fn new(bus: Arc<EventBus>, backend: Arc<B>, cols: u16, rows: u16) -> Self {
        Self {
            selection: None,
            session: SessionController::new(bus.clone(), backend.clone(), cols, rows),
            output: StreamedOutputController::new(bus.clone(), backend.clone()),
            analysis: AnalysisController::new(bus, backend),
            last_analyzed: None,
        }
    }

    pub async fn reconcile(&mut self, selection: PaneSelection) -> Result<()> {
        if self.selection.as_ref() == Some(&selection) {
            return Ok(());
        }
        debug!(
            pod = %selection.target,
            mode = selection.mode.label(),
            "reconciling pane selection"
        );

        if let Some(previous) = self.selection.take() {
            match previous.mode {
                PaneMode::Exec => self.session.close().await?,
                PaneMode::Logs | PaneMode::Describe | PaneMode::Command(_) => {
                    self.output.cancel();
                }
            }
            if previous.target != selection.target || previous.mode != selection.mode {
                self.analysis.reset();
                self.last_analyzed = None;
            }
        }

        match &selection.mode {
            PaneMode::Exec => self.session.open(selection.target.clone()).await?,
            PaneMode::Logs => {
                self.output
                    .run(StreamRequest {
                        target: selection.target.clone(),
                        kind: StreamKind::Logs {
                            tail_lines: selection.tail_lines,
                            follow: selection.follow,
                        },
                    })
                    .await?;
            }
            PaneMode::Describe => {
                self.output
                    .run(StreamRequest {
                        target: selection.target.clone(),
                        kind: StreamKind::Describe,
                    })
                    .await?;
            }
            PaneMode::Command(command) => {
                self.output
                    .run(StreamRequest {
                        target: selection.target.clone(),
                        kind: StreamKind::Command {
                            command: command.clone(),
                        },
                    })
                    .await?;
            }
        }

        self.selection = Some(selection);
        Ok(())
    }

    /// Auto-trigger: submit the accumulated output when it differs from what
    /// was last analyzed for the current mode. Returns whether a run started.
    pub async fn maybe_analyze(&mut self) -> Result<bool> {
        let Some(mode) = self
            .selection
            .as_ref()
            .and_then(PaneSelection::analysis_mode)
        else {
            return Ok(false);
        };
        let text = self.output.accumulated_text();
        if text.is_empty() {
            return Ok(false);
        }
        if self.last_analyzed.as_ref() == Some(&(mode, text.clone())) {
            return Ok(false);
        }

        self.analysis.analyze(&text, mode).await?;
        self.last_analyzed = Some((mode, text));
        Ok(true)
    }

    pub async fn reanalyze(&mut self) -> Result<()> {
        self.analysis.reanalyze().await
    }

    pub async fn teardown(&mut self) -> Result<()> {
        self.session.close().await?;
        self.output.cancel();
        self.analysis.reset();
        self.selection = None;
        self.last_analyzed = None;
        Ok(())
    }

    pub fn selection(&self) -> Option<&PaneSelection> {
        self.selection.as_ref()
    }

    pub fn session(&self) -> &SessionController<B> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionController<B> {
        &mut self.session
    }

    pub fn output(&self) -> &StreamedOutputController<B> {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut StreamedOutputController<B> {
        &mut self.output
    }

    pub fn analysis(&self) -> &AnalysisController<B> {
        &self.analysis
    }

    pub fn analysis_mut(&mut self) -> &mut AnalysisController<B> {
        &mut self.analysis
    }
}
