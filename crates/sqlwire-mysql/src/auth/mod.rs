//! Authentication plugins and their registry.
//!
//! The handshake driver owns one active [`AuthPlugin`] at a time. A plugin
//! produces the initial response from the server's seed, then reacts to any
//! number of "more data" packets until the server answers OK or ERR.

pub mod plugins;
pub mod scramble;

use std::collections::HashMap;
use std::path::PathBuf;

use sqlwire_core::Result;
use sqlwire_core::error::{AuthenticationError, AuthenticationErrorKind};

pub use plugins::{CachingSha2Password, ClearPassword, NativePassword, Sha256Password};

/// Well-known plugin names.
pub mod names {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Connection-level inputs every plugin may consult.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// PEM file holding the server's RSA public key
    pub server_rsa_public_key_file: Option<PathBuf>,
    /// Allow asking the server for its public key over a plaintext channel
    pub allow_public_key_retrieval: bool,
}

/// Per-exchange view handed to a plugin.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
    /// Whether the transport is currently encrypted
    pub encrypted: bool,
    pub options: &'a AuthOptions,
}

impl AuthContext<'_> {
    /// The password, treating an empty string like no password.
    pub fn password(&self) -> Option<&str> {
        self.password.filter(|p| !p.is_empty())
    }
}

/// What a plugin wants to do after a server "more data" packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this payload to the server.
    Respond(Vec<u8>),
    /// Nothing to send; the next server packet decides.
    Wait,
}

/// One authentication sub-protocol.
pub trait AuthPlugin: Send {
    fn name(&self) -> &'static str;

    /// Plugins that send the password in the clear refuse plaintext channels.
    fn requires_confidentiality(&self) -> bool {
        false
    }

    /// Compute the first response for `seed`, starting a new attempt.
    fn start(&mut self, seed: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>>;

    /// React to a "more data" packet (marker byte already stripped).
    fn next(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthStep>;

    /// Forget per-attempt scratch state.
    fn reset(&mut self);
}

impl std::fmt::Debug for dyn AuthPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPlugin").field("name", &self.name()).finish()
    }
}

/// Constructor registered for a plugin name.
pub type PluginConstructor = fn() -> Box<dyn AuthPlugin>;

/// Maps plugin names to constructors.
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    constructors: HashMap<String, PluginConstructor>,
    default_plugin: String,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PluginRegistry {
    /// Registry with the four built-in plugins, defaulting to `caching_sha2_password`.
    pub fn builtin() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
            default_plugin: names::CACHING_SHA2_PASSWORD.to_string(),
        };
        registry.register(names::MYSQL_NATIVE_PASSWORD, NativePassword::boxed);
        registry.register(names::CACHING_SHA2_PASSWORD, CachingSha2Password::boxed);
        registry.register(names::SHA256_PASSWORD, Sha256Password::boxed);
        registry.register(names::MYSQL_CLEAR_PASSWORD, ClearPassword::boxed);
        registry
    }

    /// Build the registry a connection uses.
    ///
    /// Extra registrations are applied first, then disabled names are removed.
    /// The default plugin must remain registered.
    pub fn configured(
        default_plugin: Option<&str>,
        disabled: &[String],
        extra: &[(String, PluginConstructor)],
    ) -> Result<Self> {
        let mut registry = Self::builtin();
        for (name, ctor) in extra {
            registry.register(name, *ctor);
        }
        for name in disabled {
            registry.constructors.remove(name.as_str());
        }
        if let Some(name) = default_plugin {
            registry.default_plugin = name.to_string();
        }
        if !registry.contains(&registry.default_plugin) {
            return Err(unsupported(&registry.default_plugin).into());
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, ctor: PluginConstructor) {
        self.constructors.insert(name.to_string(), ctor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn default_plugin(&self) -> &str {
        &self.default_plugin
    }

    /// Instantiate the plugin registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn AuthPlugin>> {
        match self.constructors.get(name) {
            Some(ctor) => Ok(ctor()),
            None => Err(unsupported(name).into()),
        }
    }
}

fn unsupported(name: &str) -> AuthenticationError {
    AuthenticationError::new(
        AuthenticationErrorKind::UnsupportedPlugin,
        format!("authentication plugin '{name}' is not available"),
    )
    .with_plugin(name)
}
