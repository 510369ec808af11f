//! Node configuration: the recognized keys of spec §6, their ranges, and
//! their defaults. Grounded in the teacher's `NodeConfig`
//! (`communication::NodeConfig`), widened with a builder because the key
//! set here is considerably larger and mostly defaulted.

use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// The minimum buffer size able to hold a handshake record, a framed wire
/// header, and the largest inline scratch buffer used internally.
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Default value of [`Config::buffer_size`] when left at zero.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Default value of [`Config::max_msg_size`].
pub const DEFAULT_MAX_MSG_SIZE: u32 = 16 * 1024 * 1024;

/// Default TCP port, per spec §6.
pub const DEFAULT_PORT: u16 = 2998;

/// Node configuration. Construct with [`Config::builder`] or
/// [`Config::default`]; always call [`Config::validate`] (done
/// automatically by `Chirp::init`/`Chirp::run`) before use.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_v4: [u8; 4],
    pub bind_v6: Ipv6Addr,
    pub backlog: u16,
    pub timeout: Duration,
    pub reuse_time: Duration,
    pub synchronous: bool,
    pub max_slots: u8,
    pub buffer_size: usize,
    pub max_msg_size: u32,
    pub identity: [u8; 16],
    pub cert_chain_pem: Option<PathBuf>,
    pub dh_params_pem: Option<PathBuf>,
    pub disable_signals: bool,
    pub disable_encryption: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            bind_v4: [0, 0, 0, 0],
            bind_v6: Ipv6Addr::UNSPECIFIED,
            backlog: 100,
            timeout: Duration::from_secs(5),
            reuse_time: Duration::from_secs(30),
            synchronous: true,
            max_slots: 16,
            buffer_size: 0,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            identity: [0; 16],
            cert_chain_pem: None,
            dh_params_pem: None,
            disable_signals: false,
            disable_encryption: false,
        }
    }
}

impl Config {
    /// Returns a [`ConfigBuilder`] seeded with the defaults of spec §6.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Resolved buffer size: [`DEFAULT_BUFFER_SIZE`] when left at zero.
    pub fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }

    /// Resolved slot cap: forced to 1 under synchronous mode regardless
    /// of what was configured, per spec §6.
    pub fn effective_max_slots(&self) -> u8 {
        if self.synchronous {
            1
        } else {
            self.max_slots
        }
    }

    /// Validates every range named in spec §6, returning
    /// [`ErrorKind::ValueError`] on the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.port <= 1024 {
            return Err(Error::simple_msg_value("PORT must be > 1024"));
        }
        if self.backlog >= 128 {
            return Err(Error::simple_msg_value("BACKLOG must be < 128"));
        }
        let timeout_secs = self.timeout.as_secs_f64();
        if !(0.1..=60.0).contains(&timeout_secs) {
            return Err(Error::simple_msg_value("TIMEOUT must be in [0.1, 60] seconds"));
        }
        let reuse_secs = self.reuse_time.as_secs_f64();
        if !(0.5..=3600.0).contains(&reuse_secs) {
            return Err(Error::simple_msg_value("REUSE_TIME must be in [0.5, 3600] seconds"));
        }
        if self.reuse_time < self.timeout {
            return Err(Error::simple_msg_value("REUSE_TIME must be >= TIMEOUT"));
        }
        if !(1..=32).contains(&self.max_slots) {
            return Err(Error::simple_msg_value("MAX_SLOTS must be in 1..=32"));
        }
        if self.buffer_size != 0 && self.buffer_size < MIN_BUFFER_SIZE {
            return Err(Error::simple_msg_value(
                "BUFFER_SIZE, when set, must be large enough for the handshake, \
                 wire header, and internal message record",
            ));
        }
        if !self.disable_encryption {
            if self.cert_chain_pem.is_none() || self.dh_params_pem.is_none() {
                return Err(Error::simple_msg_value(
                    "CERT_CHAIN_PEM and DH_PARAMS_PEM are required unless DISABLE_ENCRYPTION",
                ));
            }
            for path in [self.cert_chain_pem.as_ref(), self.dh_params_pem.as_ref()]
                .into_iter()
                .flatten()
            {
                if !path.exists() {
                    return Err(Error::simple_msg_value_owned(format!(
                        "configured PEM path does not exist: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

// small local helpers kept private: the generic `ResultSimpleExt`/
// `ResultWrappedExt` extension traits are for converting foreign
// `Result`s, not for constructing a fresh `Error` from a message.
impl Error {
    fn simple_msg_value(msg: &str) -> Error {
        Error::wrapped(ErrorKind::ValueError, msg.to_string())
    }

    fn simple_msg_value_owned(msg: String) -> Error {
        Error::wrapped(ErrorKind::ValueError, msg)
    }
}

/// Builder for [`Config`]. All setters take the value by move and return
/// `self`, mirroring the host application's expected call style
/// (`Config::builder().port(4000).build()`).
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn bind_v4(mut self, addr: [u8; 4]) -> Self {
        self.config.bind_v4 = addr;
        self
    }

    pub fn bind_v6(mut self, addr: Ipv6Addr) -> Self {
        self.config.bind_v6 = addr;
        self
    }

    pub fn backlog(mut self, backlog: u16) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn reuse_time(mut self, reuse_time: Duration) -> Self {
        self.config.reuse_time = reuse_time;
        self
    }

    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.config.synchronous = synchronous;
        self
    }

    pub fn max_slots(mut self, max_slots: u8) -> Self {
        self.config.max_slots = max_slots;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    pub fn max_msg_size(mut self, max_msg_size: u32) -> Self {
        self.config.max_msg_size = max_msg_size;
        self
    }

    pub fn identity(mut self, identity: [u8; 16]) -> Self {
        self.config.identity = identity;
        self
    }

    pub fn cert_chain_pem(mut self, path: impl AsRef<Path>) -> Self {
        self.config.cert_chain_pem = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn dh_params_pem(mut self, path: impl AsRef<Path>) -> Self {
        self.config.dh_params_pem = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn disable_signals(mut self, disable: bool) -> Self {
        self.config.disable_signals = disable;
        self
    }

    pub fn disable_encryption(mut self, disable: bool) -> Self {
        self.config.disable_encryption = disable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_encryption_disabled() {
        let cfg = Config::builder().disable_encryption(true).build();
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.effective_max_slots(), 1);
        assert_eq!(cfg.effective_buffer_size(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn rejects_low_port() {
        let cfg = Config::builder().port(80).disable_encryption(true).build();
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::ValueError);
    }

    #[test]
    fn rejects_reuse_time_below_timeout() {
        let cfg = Config::builder()
            .disable_encryption(true)
            .timeout(Duration::from_secs(10))
            .reuse_time(Duration::from_secs(5))
            .build();
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::ValueError);
    }

    #[test]
    fn async_mode_keeps_configured_slots() {
        let cfg = Config::builder()
            .disable_encryption(true)
            .synchronous(false)
            .max_slots(8)
            .build();
        assert_eq!(cfg.effective_max_slots(), 8);
    }

    #[test]
    fn requires_cert_paths_unless_disabled() {
        let cfg = Config::builder().build();
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::ValueError);
    }

    #[test]
    fn validates_existing_cert_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let dh = dir.path().join("dh.pem");
        std::fs::write(&cert, b"not a real cert").unwrap();
        std::fs::write(&dh, b"not real dh params").unwrap();
        let cfg = Config::builder()
            .cert_chain_pem(&cert)
            .dh_params_pem(&dh)
            .build();
        cfg.validate().expect("existing paths should validate");
    }
}
