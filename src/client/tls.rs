//! TLS 客户端配置
//!
//! 从 PEM 文件加载 CA、客户端证书和私钥，构造 rustls 客户端配置。

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

/// 根据网络配置构造 TLS 连接器
///
/// 必须提供 `ssl ca`；`ssl certificate` / `ssl key` 同时提供时启用客户端认证。
pub fn connector(network: &NetworkConfig) -> Result<TlsConnector> {
    let ca = network
        .ssl_ca
        .as_deref()
        .ok_or_else(|| Error::Tls("'ssl ca' is required for TLS".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("invalid CA certificate in {:?}: {}", ca, e)))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&network.ssl_certificate, &network.ssl_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::Tls(format!("invalid client certificate/key: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::Tls(
                "'ssl certificate' and 'ssl key' must be given together".into(),
            ))
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// 从 `host:port` 提取用于证书校验的服务器名
pub fn server_name(server: &str) -> Result<ServerName<'static>> {
    let host = host_of(server);
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name '{}': {}", host, e)))
}

fn host_of(server: &str) -> &str {
    if let Some(rest) = server.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    server.rsplit_once(':').map(|(host, _)| host).unwrap_or(server)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| Error::Tls(format!("failed to open {:?}: {}", path, e)))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates in {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {:?}", path)));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| Error::Tls(format!("failed to open {:?}: {}", path, e)))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("failed to parse private key in {:?}: {}", path, e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("logs.example.com:5043"), "logs.example.com");
        assert_eq!(host_of("[::1]:5043"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("logs.example.com:5043").is_ok());
        assert!(server_name("127.0.0.1:5043").is_ok());
    }

    #[test]
    fn test_missing_ca_is_error() {
        let network = NetworkConfig::default();
        assert!(matches!(connector(&network), Err(Error::Tls(_))));
    }

    #[test]
    fn test_ca_without_certificates_is_error() {
        let tmp = TempDir::new().unwrap();
        let ca = tmp.path().join("ca.pem");
        std::fs::write(&ca, "not a pem file\n").unwrap();

        let network = NetworkConfig {
            ssl_ca: Some(ca),
            ..Default::default()
        };
        let Err(err) = connector(&network) else {
            panic!("CA file without certificates was accepted");
        };
        assert!(err.to_string().contains("no certificates found"));
    }
}
