// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./target_test.rs"]
mod target_test;

use std::str::FromStr;

const DEFAULT_NAMESPACE: &str = "default";
const CLUSTER_DOMAIN: &str = "svc.cluster.local";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
  Dns,
  // A kubernetes service, resolved through its cluster DNS name.
  Kubernetes { namespace: String },
}

//
// Target
//

// A downstream target. Accepted forms:
// - host:port
// - dns:///host:port
// - kubernetes:///service:port, kubernetes:///service.namespace:port,
//   kubernetes://namespace/service:port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
  pub scheme: Scheme,
  pub host: String,
  pub port: u16,
}

impl Target {
  // The host:port string handed to the system resolver.
  #[must_use]
  pub fn lookup_name(&self) -> String {
    match &self.scheme {
      Scheme::Dns => format!("{}:{}", self.host, self.port),
      Scheme::Kubernetes { namespace } => {
        format!("{}.{namespace}.{CLUSTER_DOMAIN}:{}", self.host, self.port)
      },
    }
  }
}

fn split_host_port(endpoint: &str) -> anyhow::Result<(String, u16)> {
  let Some((host, port)) = endpoint.rsplit_once(':') else {
    anyhow::bail!("missing port in target: {endpoint}");
  };
  if host.is_empty() {
    anyhow::bail!("missing host in target: {endpoint}");
  }
  // IPv6 literals have to be bracketed.
  if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
    anyhow::bail!("invalid host in target: {endpoint}");
  }
  let port = port
    .parse()
    .map_err(|_| anyhow::anyhow!("invalid port in target: {endpoint}"))?;
  Ok((host.to_string(), port))
}

impl FromStr for Target {
  type Err = anyhow::Error;

  fn from_str(target: &str) -> anyhow::Result<Self> {
    let Some((scheme, rest)) = target.split_once("://") else {
      let (host, port) = split_host_port(target)?;
      return Ok(Self {
        scheme: Scheme::Dns,
        host,
        port,
      });
    };

    let Some((authority, endpoint)) = rest.split_once('/') else {
      anyhow::bail!("missing endpoint in target: {target}");
    };
    let (host, port) = split_host_port(endpoint)?;

    match scheme {
      "dns" => {
        if !authority.is_empty() {
          anyhow::bail!("custom DNS authorities are not supported: {target}");
        }
        Ok(Self {
          scheme: Scheme::Dns,
          host,
          port,
        })
      },
      "kubernetes" => {
        let (service, namespace) = match host.split_once('.') {
          Some((service, namespace)) => (service.to_string(), namespace.to_string()),
          None if authority.is_empty() => (host, DEFAULT_NAMESPACE.to_string()),
          None => (host, authority.to_string()),
        };
        if service.is_empty() || namespace.is_empty() || namespace.contains('.') {
          anyhow::bail!("invalid kubernetes service in target: {target}");
        }
        Ok(Self {
          scheme: Scheme::Kubernetes { namespace },
          host: service,
          port,
        })
      },
      _ => anyhow::bail!("unsupported scheme in target: {target}"),
    }
  }
}

impl std::fmt::Display for Target {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.scheme {
      Scheme::Dns => write!(f, "dns:///{}:{}", self.host, self.port),
      Scheme::Kubernetes { namespace } => {
        write!(f, "kubernetes:///{}.{namespace}:{}", self.host, self.port)
      },
    }
  }
}
