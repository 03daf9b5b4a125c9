mod ai;
mod analysis;
mod backend;
mod cli;
mod config;
mod events;
mod input;
mod k8s;
mod model;
mod panel;
mod session;
mod stream;

use ai::InsightService;
use anyhow::{Context, Result, anyhow};
use backend::{Backend, LiveBackend};
use chrono::Local;
use clap::Parser;
use cli::{CliArgs, PaneCommand};
use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::style::Stylize;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use events::{EventBus, SESSION_OUTPUT};
use futures::StreamExt;
use k8s::KubeGateway;
use kube::config::Kubeconfig;
use model::{AnalysisPhase, InsightKind, LineSeverity, SessionPhase, StreamPhase, Target};
use panel::{PaneSelection, PodPanel};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;
    let config = config::load()?;

    let target = resolve_target(&args)?;
    let bus = EventBus::new();
    let gateway = KubeGateway::new(bus.clone(), &config.defaults.shell);
    let insight = InsightService::new(bus.clone(), config.analysis.clone());
    let backend = Arc::new(LiveBackend::new(gateway, insight));

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let mut panel = PodPanel::new(bus.clone(), backend, cols, rows);

    let run_result = match args.command.clone() {
        PaneCommand::Exec { .. } => run_exec(&mut panel, &bus, target).await,
        PaneCommand::Logs {
            tail,
            no_follow,
            analyze,
            ..
        } => {
            let tail = tail.or(Some(config.defaults.tail_lines));
            let follow = !no_follow && config.defaults.follow;
            let selection = PaneSelection::logs(target, tail, follow);
            run_stream(&mut panel, selection, analyze).await
        }
        PaneCommand::Describe { analyze, .. } => {
            run_stream(&mut panel, PaneSelection::describe(target), analyze).await
        }
        PaneCommand::Run { command } => {
            let selection = PaneSelection::command(target, command.join(" "));
            run_stream(&mut panel, selection, false).await
        }
    };

    let teardown_result = panel.teardown().await;
    run_result?;
    teardown_result
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(io::stderr)
        .try_init();

    Ok(())
}

fn resolve_target(args: &CliArgs) -> Result<Target> {
    let kubeconfig = match &args.kubeconfig {
        Some(path) => Kubeconfig::read_from(path)
            .with_context(|| format!("failed to read kubeconfig {path}"))?,
        None => Kubeconfig::read().context("failed to read kubeconfig")?,
    };
    let (context_name, default_namespace) =
        k8s::resolve_context_defaults(&kubeconfig, args.context.as_deref());
    if context_name.is_empty() {
        anyhow::bail!("kubeconfig has no current context; pass --context");
    }

    let pod_name = match &args.command {
        PaneCommand::Exec { pod }
        | PaneCommand::Logs { pod, .. }
        | PaneCommand::Describe { pod, .. } => pod.clone(),
        PaneCommand::Run { .. } => "-".to_string(),
    };

    Ok(Target {
        pod_name,
        namespace: args.namespace.clone().unwrap_or(default_namespace),
        source_file: args.kubeconfig.clone().unwrap_or_default(),
        context_name,
    })
}

async fn run_stream<B: Backend>(
    panel: &mut PodPanel<B>,
    selection: PaneSelection,
    analyze: bool,
) -> Result<()> {
    panel.reconcile(selection).await?;

    let mut printed = 0;
    let mut ticker = interval(Duration::from_millis(120));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let outcome = loop {
        tokio::select! {
            _ = ticker.tick() => {
                printed = print_new_lines(panel, printed);
                match panel.output().phase() {
                    StreamPhase::Complete => break Ok(()),
                    StreamPhase::Failed(reason) => break Err(anyhow!(reason)),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                panel.output_mut().cancel();
                break Ok(());
            }
        }
    };
    print_new_lines(panel, printed);

    if analyze && outcome.is_ok() {
        run_analysis(panel).await?;
    }
    outcome
}

fn print_new_lines<B: Backend>(panel: &PodPanel<B>, printed: usize) -> usize {
    let lines = panel.output().lines();
    for line in &lines[printed.min(lines.len())..] {
        match line.severity {
            LineSeverity::Error => println!("{}", line.text.as_str().red()),
            LineSeverity::Warning => println!("{}", line.text.as_str().yellow()),
            LineSeverity::Normal => println!("{}", line.text),
        }
    }
    lines.len()
}

async fn run_analysis<B: Backend>(panel: &mut PodPanel<B>) -> Result<()> {
    if !panel.maybe_analyze().await? {
        return Ok(());
    }

    let mut ticker = interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        match panel.analysis().phase() {
            AnalysisPhase::Done => break,
            AnalysisPhase::Failed(reason) => {
                eprint!("\r\x1b[2K");
                println!("{}", format!("analysis failed: {reason}").red());
                return Ok(());
            }
            AnalysisPhase::Streaming | AnalysisPhase::Idle => {
                eprint!("\r\x1b[2Kanalyzing… {} tokens", panel.analysis().token_count());
                let _ = io::stderr().flush();
            }
        }
    }
    eprint!("\r\x1b[2K");

    let insights = panel.analysis().insights();
    println!(
        "analysis complete at {}: {} finding(s)",
        Local::now().format("%H:%M:%S"),
        insights.len()
    );
    for insight in insights {
        let label = match insight.kind {
            InsightKind::Critical => insight.kind.label().red(),
            InsightKind::Warning => insight.kind.label().yellow(),
            InsightKind::Suggestion => insight.kind.label().cyan(),
        };
        println!("[{label}] {}", insight.title);
        if !insight.body.is_empty() {
            println!("    {}", insight.body);
        }
        if let Some(command) = &insight.command {
            println!("    $ {command}");
        }
    }
    Ok(())
}

async fn run_exec<B: Backend>(
    panel: &mut PodPanel<B>,
    bus: &Arc<EventBus>,
    target: Target,
) -> Result<()> {
    // The session surface tracks screen state for the controller; the live
    // byte stream is echoed straight through so the local terminal stays a
    // faithful passthrough.
    let echo = bus.subscribe(SESSION_OUTPUT, |payload| {
        if let Some(text) = payload.as_str() {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    });

    enable_raw_mode().context("failed to enable raw mode")?;
    let run_result = drive_exec(panel, target).await;
    let restore_result = disable_raw_mode().context("failed to disable raw mode");
    drop(echo);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

async fn drive_exec<B: Backend>(panel: &mut PodPanel<B>, target: Target) -> Result<()> {
    panel.reconcile(PaneSelection::exec(target)).await?;
    if let SessionPhase::Failed(reason) = panel.session().phase() {
        return Err(anyhow!(reason));
    }

    let mut reader = EventStream::new();
    let mut ticker = interval(Duration::from_millis(200));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(bytes) = input::encode_key(key) {
                            panel.session().send_keystroke(&bytes).await?;
                        }
                    }
                    Some(Ok(Event::Resize(cols, rows))) => {
                        panel.session_mut().resize(cols, rows).await?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!("terminal event error: {error}");
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if matches!(
                    panel.session().phase(),
                    SessionPhase::Ended | SessionPhase::Failed(_)
                ) {
                    break;
                }
            }
        }
    }

    Ok(())
}
