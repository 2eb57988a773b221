use std::net::IpAddr;

use async_trait::async_trait;
use url::Url;

use cumulus_common::{Error, Result};

pub const MODE_FTP_UPLOAD: &str = "ftp_upload";
pub const MODE_HTTP_DOWNLOAD: &str = "http_download";

/// How extracted bytes leave the platform: pushed to a caller-supplied FTP
/// target, or pulled later via a generated HTTP URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    FtpUpload,
    HttpDownload,
}

impl ExtractMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            MODE_FTP_UPLOAD => Ok(ExtractMode::FtpUpload),
            MODE_HTTP_DOWNLOAD => Ok(ExtractMode::HttpDownload),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Hostname resolution seam. Injected so push-target validation is
/// deterministic under test and swappable for a caching resolver.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        // Port is irrelevant; lookup_host requires one.
        tokio::net::lookup_host((host, 21))
            .await
            .ok()?
            .next()
            .map(|addr| addr.ip())
    }
}

/// Validate an FTP push target for extraction.
///
/// The URL must parse, carry the `ftp` scheme, and point at a host whose
/// address is publicly routable IPv4: any-local, link-local, loopback,
/// multicast, and IPv6 addresses are all rejected.
pub async fn validate_push_url(raw: &str, resolver: &dyn Resolver) -> Result<()> {
    let url =
        Url::parse(raw).map_err(|e| Error::InvalidTarget(format!("invalid url {raw:?}: {e}")))?;

    if url.scheme() != "ftp" {
        return Err(Error::InvalidTarget(format!(
            "unsupported scheme {:?} for url {raw:?}",
            url.scheme()
        )));
    }

    let host = url
        .host()
        .ok_or_else(|| Error::InvalidTarget(format!("no host in url {raw:?}")))?;

    let addr = match host {
        url::Host::Ipv4(v4) => IpAddr::V4(v4),
        url::Host::Ipv6(v6) => IpAddr::V6(v6),
        url::Host::Domain(name) => resolver
            .resolve(name)
            .await
            .ok_or_else(|| Error::UnresolvedHost(name.to_string()))?,
    };

    match addr {
        IpAddr::V6(_) => Err(Error::InvalidTarget(format!(
            "IPv6 target {addr} not supported"
        ))),
        IpAddr::V4(v4) => {
            if v4.is_unspecified() || v4.is_link_local() || v4.is_loopback() || v4.is_multicast() {
                return Err(Error::InvalidTarget(format!(
                    "illegal host address {v4} in url {raw:?}"
                )));
            }
            Ok(())
        }
    }
}
