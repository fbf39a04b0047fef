//! Environment-variable feature selection, on top of the CLI arguments.

use relay_jit::BlockLimits;
use relay_runtime::EngineConfig;

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.as_str(), "0" | "no" | "off" | "false"),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `RELAY64_DYNAREC`, `RELAY64_BLOCK_LIMIT`, and friends.
pub fn engine_config_from_env() -> EngineConfig {
    let defaults = EngineConfig::default();
    let default_limits = BlockLimits::default();
    EngineConfig {
        dynarec: env_flag("RELAY64_DYNAREC", defaults.dynarec),
        block_limits: BlockLimits {
            max_insts: env_usize("RELAY64_BLOCK_LIMIT", default_limits.max_insts),
            ..default_limits
        },
        ..defaults
    }
}

/// `RELAY64_LOG` drives the tracing filter (falls back to `RUST_LOG`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("RELAY64_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
