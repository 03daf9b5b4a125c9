use anyhow::Result;
use std::future::Future;

use crate::ai::InsightService;
use crate::k8s::KubeGateway;
use crate::model::{AnalysisMode, Target};

/// The command surface the controllers drive. Request/response calls settle
/// through the returned future; streaming results arrive solely as events on
/// the shared bus, so callers must have their listeners registered before
/// invoking any of the streaming operations.
pub trait Backend: Send + Sync + 'static {
    fn start_session(
        &self,
        target: &Target,
        cols: u16,
        rows: u16,
    ) -> impl Future<Output = Result<()>> + Send;

    fn write_session(&self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn resize_session(&self, cols: u16, rows: u16) -> impl Future<Output = Result<()>> + Send;

    fn stop_session(&self) -> impl Future<Output = Result<()>> + Send;

    fn describe(&self, target: &Target) -> impl Future<Output = Result<String>> + Send;

    fn stream_logs(
        &self,
        target: &Target,
        tail_lines: Option<u32>,
        follow: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    fn run_command(
        &self,
        target: &Target,
        command: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn submit_analysis(
        &self,
        output: &str,
        mode: AnalysisMode,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Production wiring: cluster operations via the kubectl/kube gateway, analysis
/// via the insight service. Both emit onto the same event bus.
pub struct LiveBackend {
    kube: KubeGateway,
    insight: InsightService,
}

impl LiveBackend {
    pub fn new(kube: KubeGateway, insight: InsightService) -> Self {
        Self { kube, insight }
    }
}

impl Backend for LiveBackend {
    async fn start_session(&self, target: &Target, cols: u16, rows: u16) -> Result<()> {
        self.kube.start_session(target, cols, rows).await
    }

    async fn write_session(&self, bytes: &[u8]) -> Result<()> {
        self.kube.write_session(bytes).await
    }

    async fn resize_session(&self, cols: u16, rows: u16) -> Result<()> {
        self.kube.resize_session(cols, rows).await
    }

    async fn stop_session(&self) -> Result<()> {
        self.kube.stop_session().await
    }

    async fn describe(&self, target: &Target) -> Result<String> {
        self.kube.describe(target).await
    }

    async fn stream_logs(&self, target: &Target, tail_lines: Option<u32>, follow: bool) -> Result<()> {
        self.kube.stream_logs(target, tail_lines, follow).await
    }

    async fn run_command(&self, target: &Target, command: &str) -> Result<()> {
        self.kube.run_command(target, command).await
    }

    async fn submit_analysis(&self, output: &str, mode: AnalysisMode) -> Result<()> {
        self.insight.submit(output, mode).await
    }
}

#[cfg(test)]
pub mod mock {
    use super::Backend;
    use crate::events::{self, EventBus};
    use crate::model::{AnalysisMode, Target};
    use anyhow::{Result, anyhow};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        StartSession {
            target: Target,
            cols: u16,
            rows: u16,
            listeners: usize,
        },
        WriteSession {
            bytes: Vec<u8>,
        },
        ResizeSession {
            cols: u16,
            rows: u16,
        },
        StopSession,
        Describe {
            target: Target,
        },
        StreamLogs {
            target: Target,
            tail_lines: Option<u32>,
            follow: bool,
            listeners: usize,
        },
        RunCommand {
            target: Target,
            command: String,
            listeners: usize,
        },
        SubmitAnalysis {
            output: String,
            mode: AnalysisMode,
            listeners: usize,
        },
    }

    /// Records every backend call together with how many listeners were
    /// registered for the operation's events at call time, which is what the
    /// subscribe-before-trigger assertions check.
    pub struct MockBackend {
        bus: Arc<EventBus>,
        pub calls: Mutex<Vec<MockCall>>,
        pub fail_next: Mutex<Option<String>>,
        pub describe_text: Mutex<String>,
    }

    impl MockBackend {
        pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
            Arc::new(Self {
                bus,
                calls: Mutex::new(Vec::new()),
                fail_next: Mutex::new(None),
                describe_text: Mutex::new(String::new()),
            })
        }

        pub fn fail_next_with(&self, reason: &str) {
            *self.fail_next.lock() = Some(reason.to_string());
        }

        pub fn set_describe_text(&self, text: &str) {
            *self.describe_text.lock() = text.to_string();
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().clone()
        }

        fn take_failure(&self) -> Result<()> {
            match self.fail_next.lock().take() {
                Some(reason) => Err(anyhow!(reason)),
                None => Ok(()),
            }
        }

        fn listeners_for(&self, names: &[&str]) -> usize {
            names
                .iter()
                .map(|name| self.bus.listener_count(name))
                .sum()
        }
    }

    impl Backend for MockBackend {
        async fn start_session(&self, target: &Target, cols: u16, rows: u16) -> Result<()> {
            let listeners =
                self.listeners_for(&[events::SESSION_OUTPUT, events::SESSION_DONE]);
            self.calls.lock().push(MockCall::StartSession {
                target: target.clone(),
                cols,
                rows,
                listeners,
            });
            self.take_failure()
        }

        async fn write_session(&self, bytes: &[u8]) -> Result<()> {
            self.calls.lock().push(MockCall::WriteSession {
                bytes: bytes.to_vec(),
            });
            self.take_failure()
        }

        async fn resize_session(&self, cols: u16, rows: u16) -> Result<()> {
            self.calls
                .lock()
                .push(MockCall::ResizeSession { cols, rows });
            self.take_failure()
        }

        async fn stop_session(&self) -> Result<()> {
            self.calls.lock().push(MockCall::StopSession);
            self.take_failure()
        }

        async fn describe(&self, target: &Target) -> Result<String> {
            self.calls.lock().push(MockCall::Describe {
                target: target.clone(),
            });
            self.take_failure()?;
            Ok(self.describe_text.lock().clone())
        }

        async fn stream_logs(
            &self,
            target: &Target,
            tail_lines: Option<u32>,
            follow: bool,
        ) -> Result<()> {
            let listeners =
                self.listeners_for(&[events::LOG_LINE, events::LOG_ERROR, events::LOG_DONE]);
            self.calls.lock().push(MockCall::StreamLogs {
                target: target.clone(),
                tail_lines,
                follow,
                listeners,
            });
            self.take_failure()
        }

        async fn run_command(&self, target: &Target, command: &str) -> Result<()> {
            let listeners =
                self.listeners_for(&[events::COMMAND_LINE, events::COMMAND_DONE]);
            self.calls.lock().push(MockCall::RunCommand {
                target: target.clone(),
                command: command.to_string(),
                listeners,
            });
            self.take_failure()
        }

        async fn submit_analysis(&self, output: &str, mode: AnalysisMode) -> Result<()> {
            let listeners =
                self.listeners_for(&[events::ANALYSIS_TOKEN, events::ANALYSIS_DONE]);
            self.calls.lock().push(MockCall::SubmitAnalysis {
                output: output.to_string(),
                mode,
                listeners,
            });
            self.take_failure()
        }
    }

    pub fn test_target(pod_name: &str, namespace: &str) -> Target {
        Target {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            source_file: "/tmp/kubeconfig".to_string(),
            context_name: "test-cluster".to_string(),
        }
    }
}
