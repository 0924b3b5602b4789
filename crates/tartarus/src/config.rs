//! Sandbox configuration loaded from environment variables

use std::env;
use std::path::PathBuf;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory under which per-evaluation workspaces are created
    pub workspace_root: PathBuf,

    /// Container CLI to invoke
    pub docker_binary: String,

    /// Optional `DOCKER_API_VERSION` passed to the CLI
    pub docker_api_version: Option<String>,

    /// Hard timeout for the build step in milliseconds
    pub compile_timeout_ms: u64,

    /// Memory ceiling for the build step in MB
    pub compile_memory_mb: u64,

    /// CPU share for the build step
    pub compile_cpus: f64,

    /// Process-count ceiling for every container
    pub pids_limit: u32,

    /// Extra wall-clock allowance for container start-up, added to the batch budget
    pub startup_allowance_ms: u64,

    /// Largest stdout file read back per test case
    pub output_limit_bytes: u64,

    /// Per-language image overrides
    pub images: ImageOverrides,
}

/// Per-language image overrides; `None` keeps the built-in image.
#[derive(Debug, Clone, Default)]
pub struct ImageOverrides {
    pub cpp: Option<String>,
    pub c: Option<String>,
    pub rust: Option<String>,
    pub go: Option<String>,
    pub python: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: env::temp_dir().join("tartarus"),
            docker_binary: "docker".to_string(),
            docker_api_version: None,
            compile_timeout_ms: 30_000,
            compile_memory_mb: 1024,
            compile_cpus: 1.0,
            pids_limit: 64,
            startup_allowance_ms: 2_000,
            output_limit_bytes: 16 * 1024 * 1024, // 16 MB
            images: ImageOverrides::default(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            docker_binary: env::var("DOCKER_BINARY").unwrap_or(defaults.docker_binary),
            docker_api_version: env::var("DOCKER_API_VERSION").ok(),
            compile_timeout_ms: parse_or("COMPILE_TIMEOUT_MS", defaults.compile_timeout_ms),
            compile_memory_mb: parse_or("COMPILE_MEMORY_MB", defaults.compile_memory_mb),
            compile_cpus: parse_or("COMPILE_CPUS", defaults.compile_cpus),
            pids_limit: parse_or("PIDS_LIMIT", defaults.pids_limit),
            startup_allowance_ms: parse_or("STARTUP_ALLOWANCE_MS", defaults.startup_allowance_ms),
            output_limit_bytes: parse_or("OUTPUT_LIMIT_BYTES", defaults.output_limit_bytes),
            images: ImageOverrides {
                cpp: env::var("IMAGE_CPP").ok(),
                c: env::var("IMAGE_C").ok(),
                rust: env::var("IMAGE_RUST").ok(),
                go: env::var("IMAGE_GO").ok(),
                python: env::var("IMAGE_PYTHON").ok(),
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
