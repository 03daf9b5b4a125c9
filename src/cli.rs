use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "beluga",
    version,
    about = "A pod-focused Kubernetes session cockpit with AI output analysis."
)]
pub struct CliArgs {
    /// Namespace (defaults to the kubeconfig context's namespace)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Kubeconfig context (defaults to the current context)
    #[arg(long)]
    pub context: Option<String>,

    /// Path to a kubeconfig file (defaults to the standard discovery chain)
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: PaneCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum PaneCommand {
    /// Open an interactive shell inside a pod
    Exec {
        pod: String,
    },

    /// Stream a pod's logs with error/warning highlighting
    Logs {
        pod: String,
        /// Number of trailing lines to request
        #[arg(long)]
        tail: Option<u32>,
        /// Fetch once instead of following
        #[arg(long)]
        no_follow: bool,
        /// Run AI analysis over the collected output
        #[arg(long)]
        analyze: bool,
    },

    /// Show kubectl describe output with highlighting
    Describe {
        pod: String,
        /// Run AI analysis over the collected output
        #[arg(long)]
        analyze: bool,
    },

    /// Run a raw kubectl command and stream its output
    Run {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}
