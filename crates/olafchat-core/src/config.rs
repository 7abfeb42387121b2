//! Static configuration for servers and clients.
//!
//! The neighbourhood is a fixed, configured set of peer servers; there is
//! no discovery. Addresses are plain `host:port` strings, which is also how
//! servers identify themselves in `server_hello` and `client_list`.

use crate::error::{Error, Result};

/// Configuration for a home server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname or IP address to bind.
    pub host: String,
    /// Port to bind. Serves both the WebSocket endpoint and the HTTP file
    /// surface.
    pub port: u16,
    /// Neighbour servers to dial and accept, as `host:port` strings.
    pub neighbours: Vec<String>,
}

impl ServerConfig {
    /// The `host:port` identity this server uses on the wire.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration.
    ///
    /// Rejects neighbour entries that are not `host:port` shaped. The
    /// server's own address may appear in the list (convenient when every
    /// node ships the same neighbourhood file); it is skipped at dial time.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("bind host must not be empty".into()));
        }
        for peer in &self.neighbours {
            parse_address(peer)?;
        }
        Ok(())
    }
}

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the home server, as `host:port`.
    pub server_addr: String,
}

impl ClientConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        parse_address(&self.server_addr)?;
        Ok(())
    }
}

/// Split a `host:port` string, validating the port.
pub fn parse_address(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address {:?} is not host:port", addr)))?;
    if host.is_empty() {
        return Err(Error::Config(format!("address {:?} has an empty host", addr)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("address {:?} has an invalid port", addr)))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let (host, port) = parse_address("localhost:4678").expect("should parse");
        assert_eq!(host, "localhost");
        assert_eq!(port, 4678);
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!(parse_address("no-port-here").is_err());
        assert!(parse_address(":4678").is_err());
        assert!(parse_address("host:notaport").is_err());
        assert!(parse_address("host:70000").is_err());
    }

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 4678,
            neighbours: vec!["127.0.0.1:4679".to_string()],
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "127.0.0.1:4678");

        let bad = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 4678,
            neighbours: vec!["not an address".to_string()],
        };
        assert!(bad.validate().is_err());
    }
}
