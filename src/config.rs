// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs,
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//==============================================================================
// Structures
//==============================================================================

/// Server configuration, loaded from a YAML file.
///
/// Expected document shape:
///
/// ```yaml
/// server:
///   addr: "10.0.1.8:10000"
///   mac: "08:00:27:c2:17:e8"
///   backlog: 128
/// handoff:
///   addr: "10.0.1.8:20000"
/// switch:
///   addr: "10.0.1.1:30000"
/// tls:
///   cert: "server.crt"     # optional
///   key: "server.key"      # optional
/// backends:                # optional, handoff targets for the front end
///   - "10.0.1.9:20000"
/// ```
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//==============================================================================
// Associate Functions
//==============================================================================

impl Config {
    /// Reads and parses the configuration file at `config_path`.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let text: String = fs::read_to_string(config_path)
            .map_err(|_| Fail::new(libc::EINVAL, "could not read config file"))?;
        let mut docs: Vec<Yaml> = YamlLoader::load_from_str(&text)
            .map_err(|_| Fail::new(libc::EINVAL, "could not parse config file"))?;
        if docs.is_empty() {
            return Err(Fail::new(libc::EINVAL, "empty config file"));
        }
        Ok(Self(docs.swap_remove(0)))
    }

    /// Address the HTTP listener binds to.
    pub fn server_addr(&self) -> Result<SocketAddrV4, Fail> {
        self.addr_of(&self.0["server"], "addr")
    }

    /// Local MAC address, announced to the switch on flow ownership changes.
    pub fn server_mac(&self) -> Result<eui48::MacAddress, Fail> {
        let mac_s: &str = self.0["server"]["mac"]
            .as_str()
            .ok_or_else(|| Fail::new(libc::EINVAL, "missing server.mac"))?;
        eui48::MacAddress::parse_str(mac_s).map_err(|_| Fail::new(libc::EINVAL, "malformed server.mac"))
    }

    /// Listen backlog for both the HTTP and handoff listeners.
    pub fn backlog(&self) -> i32 {
        self.0["server"]["backlog"].as_i64().unwrap_or(128) as i32
    }

    /// Address the handoff channel listener binds to.
    pub fn handoff_addr(&self) -> Result<SocketAddrV4, Fail> {
        self.addr_of(&self.0["handoff"], "addr")
    }

    /// Address of the switch control plane.
    pub fn switch_addr(&self) -> Result<SocketAddrV4, Fail> {
        self.addr_of(&self.0["switch"], "addr")
    }

    /// TLS certificate and key paths, if TLS is enabled.
    pub fn tls_paths(&self) -> Option<(String, String)> {
        let cert: &str = self.0["tls"]["cert"].as_str()?;
        let key: &str = self.0["tls"]["key"].as_str()?;
        Some((cert.to_string(), key.to_string()))
    }

    /// Handoff addresses of the back-end servers this instance may hand
    /// connections to. Empty when this instance never initiates handoffs.
    pub fn backends(&self) -> Result<Vec<SocketAddrV4>, Fail> {
        let mut backends: Vec<SocketAddrV4> = Vec::new();
        if let Some(list) = self.0["backends"].as_vec() {
            for entry in list {
                let addr_s: &str = entry
                    .as_str()
                    .ok_or_else(|| Fail::new(libc::EINVAL, "malformed backends entry"))?;
                backends.push(parse_addr(addr_s)?);
            }
        }
        Ok(backends)
    }

    fn addr_of(&self, section: &Yaml, key: &str) -> Result<SocketAddrV4, Fail> {
        let addr_s: &str = section[key]
            .as_str()
            .ok_or_else(|| Fail::new(libc::EINVAL, "missing address in config"))?;
        parse_addr(addr_s)
    }
}

//==============================================================================
// Functions
//==============================================================================

fn parse_addr(addr_s: &str) -> Result<SocketAddrV4, Fail> {
    match SocketAddrV4::from_str(addr_s) {
        Ok(addr) => Ok(addr),
        // Allow a bare IPv4 address with an implied port of zero.
        Err(_) => match Ipv4Addr::from_str(addr_s) {
            Ok(ip) => Ok(SocketAddrV4::new(ip, 0)),
            Err(_) => Err(Fail::new(libc::EINVAL, "malformed address in config")),
        },
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::Config;
    use ::std::{net::SocketAddrV4, str::FromStr};
    use ::yaml_rust::YamlLoader;

    const SAMPLE: &str = r#"
server:
  addr: "10.0.1.8:10000"
  mac: "08:00:27:c2:17:e8"
  backlog: 64
handoff:
  addr: "10.0.1.8:20000"
switch:
  addr: "10.0.1.1:30000"
backends:
  - "10.0.1.9:20000"
  - "10.0.1.10:20000"
"#;

    fn sample() -> Config {
        Config(YamlLoader::load_from_str(SAMPLE).unwrap().swap_remove(0))
    }

    #[test]
    fn test_addresses() {
        let config = sample();
        assert_eq!(
            config.server_addr().unwrap(),
            SocketAddrV4::from_str("10.0.1.8:10000").unwrap()
        );
        assert_eq!(
            config.handoff_addr().unwrap(),
            SocketAddrV4::from_str("10.0.1.8:20000").unwrap()
        );
        assert_eq!(
            config.switch_addr().unwrap(),
            SocketAddrV4::from_str("10.0.1.1:30000").unwrap()
        );
        assert_eq!(config.backlog(), 64);
        assert_eq!(config.backends().unwrap().len(), 2);
        assert!(config.tls_paths().is_none());
    }

    #[test]
    fn test_missing_field() {
        let config = Config(YamlLoader::load_from_str("server: {}").unwrap().swap_remove(0));
        assert!(config.server_addr().is_err());
        assert!(config.server_mac().is_err());
    }

    #[test]
    fn test_mac_parse() {
        let config = sample();
        assert_eq!(config.server_mac().unwrap().to_canonical(), "08-00-27-c2-17-e8");
    }
}
