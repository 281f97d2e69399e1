use clap::Args;

pub mod commands;

/// Connection settings shared by every command that talks to the
/// distribution service.
#[derive(Debug, Clone, Args)]
pub struct ApiArgs {
    /// Base URL of the primary API endpoint
    #[arg(long, env = "GANTRY_API_URL")]
    pub api_url: String,

    /// Mirror base URL, in priority order (repeatable)
    #[arg(long = "mirror")]
    pub mirrors: Vec<String>,

    /// Application access key
    #[arg(long, env = "GANTRY_SECRET")]
    pub secret: String,

    /// Delay in milliseconds before each additional mirror joins the race
    #[arg(long, default_value_t = 5000)]
    pub stagger_ms: u64,
}
