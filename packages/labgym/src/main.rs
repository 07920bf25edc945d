// packages/labgym/src/main.rs
//! labgym worker
//!
//! Launched by a supervisor with a connected socket on fd 3. Builds one
//! environment, serves it until told to close and exits.

use anyhow::Result;
use labgym::observability::{describe_metrics, init_tracing};
use labgym::runtime::worker::run_from_env;
use labgym::{BuildInfo, EngineConfig, EntryPoints};
use tracing::{debug, info};

fn main() -> Result<()> {
    // Fall back to defaults so a bad config file cannot stop the handshake
    let config = EngineConfig::load().unwrap_or_default();
    init_tracing(&config.logging)?;
    describe_metrics();

    let build = BuildInfo::current();
    info!(
        "Starting labgym worker v{} ({}), pid {}",
        build.version,
        build.git_hash,
        std::process::id()
    );
    debug!("Built {} with {}", build.build_timestamp, build.rustc_version);

    let code = run_from_env(&EntryPoints::builtin());
    info!("Worker finished with exit code {}", code);
    std::process::exit(code);
}
