use anyhow::{Context, Result};
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use parking_lot::Mutex;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde_json::Value;
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt as _;
use tokio::io::BufReader;
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{
    COMMAND_DONE, COMMAND_LINE, EventBus, LOG_DONE, LOG_ERROR, LOG_LINE, SESSION_DONE,
    SESSION_OUTPUT,
};
use crate::model::Target;

struct PtySessionHandle {
    writer: Box<dyn Write + Send>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

struct CachedClient {
    source_file: String,
    context_name: String,
    client: Client,
}

/// Cluster-side collaborator: one PTY-backed `kubectl exec` slot, one log
/// stream slot, one raw-command slot. Results reach the controllers only as
/// bus events; a new request for a slot replaces whatever ran there before.
pub struct KubeGateway {
    bus: Arc<EventBus>,
    shell: String,
    pty_slot: Arc<Mutex<Option<PtySessionHandle>>>,
    client_cache: tokio::sync::Mutex<Option<CachedClient>>,
    log_task: Mutex<Option<JoinHandle<()>>>,
    command_task: Mutex<Option<JoinHandle<()>>>,
}

impl KubeGateway {
    pub fn new(bus: Arc<EventBus>, shell: impl Into<String>) -> Self {
        Self {
            bus,
            shell: shell.into(),
            pty_slot: Arc::new(Mutex::new(None)),
            client_cache: tokio::sync::Mutex::new(None),
            log_task: Mutex::new(None),
            command_task: Mutex::new(None),
        }
    }

    pub async fn start_session(&self, target: &Target, cols: u16, rows: u16) -> Result<()> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let mut cmd = CommandBuilder::new("kubectl");
        for arg in exec_args(target, &self.shell) {
            cmd.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn kubectl exec for {target}"))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        {
            let mut slot = self.pty_slot.lock();
            if let Some(mut previous) = slot.take() {
                let _ = previous.child.kill();
            }
            *slot = Some(PtySessionHandle {
                writer,
                master: pair.master,
                child,
            });
        }

        // Raw PTY bytes, ANSI sequences included, go out as lossy UTF-8 so the
        // render surface receives them unchanged.
        let bus = self.bus.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        bus.emit(SESSION_OUTPUT, Value::String(chunk));
                    }
                    Err(error) => {
                        debug!("PTY read loop ended: {error}");
                        break;
                    }
                }
            }
            bus.emit(SESSION_DONE, Value::Null);
        });

        Ok(())
    }

    pub async fn write_session(&self, bytes: &[u8]) -> Result<()> {
        let mut slot = self.pty_slot.lock();
        if let Some(session) = slot.as_mut() {
            session
                .writer
                .write_all(bytes)
                .context("PTY write failed")?;
            session.writer.flush().context("PTY flush failed")?;
        }
        Ok(())
    }

    pub async fn resize_session(&self, cols: u16, rows: u16) -> Result<()> {
        let slot = self.pty_slot.lock();
        if let Some(session) = slot.as_ref() {
            session
                .master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .context("PTY resize failed")?;
        }
        Ok(())
    }

    pub async fn stop_session(&self) -> Result<()> {
        let taken = self.pty_slot.lock().take();
        if let Some(mut session) = taken
            && let Err(error) = session.child.kill()
        {
            // Tolerated: the remote shell may already have exited.
            debug!("kill on session teardown: {error}");
        }
        Ok(())
    }

    pub async fn describe(&self, target: &Target) -> Result<String> {
        let mut cmd = TokioCommand::new("kubectl");
        cmd.arg("describe")
            .arg("pod")
            .arg(&target.pod_name)
            .arg("-n")
            .arg(&target.namespace);
        for arg in scope_args(target) {
            cmd.arg(arg);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run kubectl describe for {target}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            anyhow::bail!(
                "kubectl describe exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        if stderr.trim().is_empty() {
            Ok(stdout.to_string())
        } else if stdout.trim().is_empty() {
            Ok(format!("stderr:\n{stderr}"))
        } else {
            Ok(format!("{stdout}\n\nstderr:\n{stderr}"))
        }
    }

    pub async fn stream_logs(
        &self,
        target: &Target,
        tail_lines: Option<u32>,
        follow: bool,
    ) -> Result<()> {
        let client = self.client_for(target).await?;
        let pods: Api<Pod> = Api::namespaced(client, &target.namespace);
        let params = LogParams {
            follow,
            tail_lines: tail_lines.map(i64::from),
            ..LogParams::default()
        };

        let stream = pods
            .log_stream(&target.pod_name, &params)
            .await
            .with_context(|| format!("failed to open log stream for {target}"))?;

        let bus = self.bus.clone();
        let task = tokio::spawn(async move {
            let mut lines = stream.lines();
            loop {
                match lines.try_next().await {
                    Ok(Some(line)) => bus.emit(LOG_LINE, Value::String(line)),
                    Ok(None) => break,
                    Err(error) => {
                        bus.emit(LOG_ERROR, Value::String(format!("log stream error: {error}")));
                        break;
                    }
                }
            }
            bus.emit(LOG_DONE, Value::Null);
        });

        let mut slot = self.log_task.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(task);
        Ok(())
    }

    pub async fn run_command(&self, target: &Target, command: &str) -> Result<()> {
        let args = normalize_command(command)?;
        let mut cmd = TokioCommand::new("kubectl");
        cmd.args(&args);
        for arg in scope_args(target) {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn kubectl {}", args.join(" ")))?;
        let stdout = child.stdout.take().context("kubectl stdout unavailable")?;
        let stderr = child.stderr.take().context("kubectl stderr unavailable")?;

        let bus = self.bus.clone();
        let stdout_bus = bus.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_bus.emit(COMMAND_LINE, Value::String(line));
            }
        });
        let stderr_bus = bus.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_bus.emit(COMMAND_LINE, Value::String(line));
            }
        });

        let task = tokio::spawn(async move {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            match child.wait().await {
                Ok(status) if !status.success() => {
                    bus.emit(
                        COMMAND_LINE,
                        Value::String(format!("kubectl exited with {status}")),
                    );
                }
                Err(error) => {
                    warn!("waiting on kubectl failed: {error}");
                }
                Ok(_) => {}
            }
            bus.emit(COMMAND_DONE, Value::Null);
        });

        let mut slot = self.command_task.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(task);
        Ok(())
    }

    async fn client_for(&self, target: &Target) -> Result<Client> {
        let mut cache = self.client_cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.source_file == target.source_file
            && cached.context_name == target.context_name
        {
            return Ok(cached.client.clone());
        }

        let kubeconfig = if target.source_file.is_empty() {
            Kubeconfig::read().context("failed to read kubeconfig")?
        } else {
            Kubeconfig::read_from(&target.source_file)
                .with_context(|| format!("failed to read kubeconfig {}", target.source_file))?
        };
        let options = KubeConfigOptions {
            context: Some(target.context_name.clone()),
            cluster: None,
            user: None,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .context("failed to infer Kubernetes configuration")?;
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

        *cache = Some(CachedClient {
            source_file: target.source_file.clone(),
            context_name: target.context_name.clone(),
            client: client.clone(),
        });
        Ok(client)
    }
}

fn scope_args(target: &Target) -> Vec<String> {
    let mut args = Vec::new();
    if !target.source_file.is_empty() {
        args.push(format!("--kubeconfig={}", target.source_file));
    }
    if !target.context_name.is_empty() {
        args.push(format!("--context={}", target.context_name));
    }
    args
}

fn exec_args(target: &Target, shell: &str) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-it".to_string(),
        target.pod_name.clone(),
        "-n".to_string(),
        target.namespace.clone(),
    ];
    args.extend(scope_args(target));
    args.push("--".to_string());
    args.push(shell.to_string());
    args
}

// Users type either `kubectl get pods` or just `get pods`; both run the same
// way. Whitespace splitting only, no shell quoting.
fn normalize_command(command: &str) -> Result<Vec<String>> {
    let mut args = command
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    if args.first().is_some_and(|first| first == "kubectl") {
        args.remove(0);
    }
    if args.is_empty() {
        anyhow::bail!("empty kubectl command");
    }
    Ok(args)
}

/// Resolves the effective context name and namespace for a kubeconfig, used
/// when the CLI leaves either unspecified.
pub fn resolve_context_defaults(
    kubeconfig: &Kubeconfig,
    requested_context: Option<&str>,
) -> (String, String) {
    let context_name = requested_context
        .map(str::to_string)
        .or_else(|| kubeconfig.current_context.clone())
        .unwrap_or_default();
    let namespace = kubeconfig
        .contexts
        .iter()
        .find(|entry| entry.name == context_name)
        .and_then(|entry| entry.context.as_ref())
        .and_then(|context| context.namespace.clone())
        .unwrap_or_else(|| "default".to_string());
    (context_name, namespace)
}

#[cfg(test)]
mod tests {
    use super::{exec_args, normalize_command, resolve_context_defaults, scope_args};
    use crate::backend::mock::test_target;
    use kube::config::Kubeconfig;

    #[test]
    fn exec_args_carry_target_scope_and_shell() {
        let args = exec_args(&test_target("api-7f", "prod"), "/bin/sh");
        assert_eq!(
            args,
            vec![
                "exec",
                "-it",
                "api-7f",
                "-n",
                "prod",
                "--kubeconfig=/tmp/kubeconfig",
                "--context=test-cluster",
                "--",
                "/bin/sh",
            ]
        );
    }

    #[test]
    fn scope_args_skip_empty_kubeconfig() {
        let mut target = test_target("api-7f", "prod");
        target.source_file = String::new();
        assert_eq!(scope_args(&target), vec!["--context=test-cluster"]);
    }

    #[test]
    fn normalize_command_strips_kubectl_prefix() {
        assert_eq!(
            normalize_command("kubectl get pods -o wide").unwrap(),
            vec!["get", "pods", "-o", "wide"]
        );
        assert_eq!(normalize_command("get pods").unwrap(), vec!["get", "pods"]);
        assert!(normalize_command("   ").is_err());
        assert!(normalize_command("kubectl").is_err());
    }

    #[test]
    fn context_defaults_come_from_the_selected_context() {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(
            r#"
apiVersion: v1
kind: Config
current-context: staging
contexts:
  - name: staging
    context:
      cluster: staging
      user: dev
      namespace: staging-apps
  - name: prod
    context:
      cluster: prod
      user: ops
"#,
        )
        .unwrap();

        let (context, namespace) = resolve_context_defaults(&kubeconfig, None);
        assert_eq!(context, "staging");
        assert_eq!(namespace, "staging-apps");

        let (context, namespace) = resolve_context_defaults(&kubeconfig, Some("prod"));
        assert_eq!(context, "prod");
        assert_eq!(namespace, "default");
    }
}
