//! Environment-driven configuration.

use serde::{Deserialize, Serialize};

/// Engine address used when no override is present.
pub const DEFAULT_ENGINE_HOST: &str = "unix:///var/run/docker.sock";

/// Base image the workspace is layered on.
pub const DEFAULT_IMAGE: &str = "docker/cagent:latest";

/// Agent executable inside the image.
pub const DEFAULT_AGENT_BINARY: &str = "/cagent";

/// Name of the API key variable forwarded into the interactive process.
pub const DEFAULT_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Mount point of the local context inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// `PATH` given to every process started in the container.
pub const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Name under which the local working directory is exposed to the engine.
pub const LOCAL_CONTEXT_MOUNT: &str = "context";

/// Environment variable names read by [`Config::from_env`].
pub mod env_keys {
    /// Build engine address override.
    pub const ENGINE_HOST: &str = "AILD_ENGINE_HOST";
    /// Secondary address source, honoured when `AILD_ENGINE_HOST` is unset.
    pub const DOCKER_HOST: &str = "DOCKER_HOST";
    pub const IMAGE: &str = "AILD_IMAGE";
    pub const AGENT_BINARY: &str = "AILD_AGENT_BINARY";
    pub const API_KEY_VAR: &str = "AILD_API_KEY_VAR";
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Address of the build engine.
    pub engine_host: String,
    /// Base image for the workspace snapshot.
    pub image: String,
    /// Agent executable started as `<agent_binary> run <agent>`.
    pub agent_binary: String,
    /// Name of the API key variable to forward.
    pub api_key_var: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_host: DEFAULT_ENGINE_HOST.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            agent_binary: DEFAULT_AGENT_BINARY.to_string(),
            api_key_var: DEFAULT_API_KEY_VAR.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    ///
    /// Empty values are treated the same as unset ones.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            engine_host: get(env_keys::ENGINE_HOST)
                .or_else(|| get(env_keys::DOCKER_HOST))
                .unwrap_or(defaults.engine_host),
            image: get(env_keys::IMAGE).unwrap_or(defaults.image),
            agent_binary: get(env_keys::AGENT_BINARY).unwrap_or(defaults.agent_binary),
            api_key_var: get(env_keys::API_KEY_VAR).unwrap_or(defaults.api_key_var),
        }
    }
}
