//! Validating admission webhook for Presto resources.
//!
//! Rejects updates that change `spec.coordinator.cpuRequest`. Everything
//! else is admitted; spec validation proper happens in the controller.

use crate::crd::Presto;
use anyhow::Context;
use axum::routing::post;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Path the API server posts Presto admission reviews to
pub const VALIDATE_PATH: &str = "/validate-falarica-v1alpha1-presto";

/// A rejected field, rendered as `path: message`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct FieldError {
    pub path: &'static str,
    pub message: &'static str,
}

impl FieldError {
    fn immutable(path: &'static str) -> Self {
        Self {
            path,
            message: "field is immutable",
        }
    }
}

/// Check an update of `old` into `new`
pub fn validate_update(old: &Presto, new: &Presto) -> Result<(), FieldError> {
    if old.spec.coordinator.node.cpu_request != new.spec.coordinator.node.cpu_request {
        return Err(FieldError::immutable("spec.coordinator.cpuRequest"));
    }
    Ok(())
}

/// Decide one admission request
pub fn review(request: &AdmissionRequest<Presto>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if request.operation != Operation::Update {
        return response;
    }

    match (&request.old_object, &request.object) {
        (Some(old), Some(new)) => match validate_update(old, new) {
            Ok(()) => response,
            Err(e) => {
                warn!(uid = %request.uid, name = %request.name, error = %e, "Denied Presto update");
                response.deny(e.to_string())
            }
        },
        _ => {
            debug!(uid = %request.uid, "Update without both objects, allowing");
            response
        }
    }
}

async fn validate_handler(
    Json(body): Json<AdmissionReview<Presto>>,
) -> Json<AdmissionReview<kube::core::DynamicObject>> {
    let request: AdmissionRequest<Presto> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review(&request).into_review())
}

pub fn router() -> Router {
    Router::new().route(VALIDATE_PATH, post(validate_handler))
}

/// Build the TLS server configuration from a PEM certificate chain and key
pub fn tls_config(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse webhook certificate")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in PEM input");
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to parse webhook private key")?
        .context("No private key found in PEM input")?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Webhook certificate and key do not match")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Serve the admission endpoint over TLS; the API server only calls
/// webhooks over HTTPS
pub async fn serve(addr: SocketAddr, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let cert_pem = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("Failed to read {}", cert_path.display()))?;
    let key_pem = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("Failed to read {}", key_path.display()))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config(&cert_pem, &key_pem)?));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind admission webhook")?;
    info!(address = %addr, path = VALIDATE_PATH, "Starting admission webhook");

    let app = router();
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "Webhook connection closed with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_test_presto;
    use serde_json::json;

    fn with_cpu_request(cpu: Option<&str>) -> Presto {
        let mut presto = create_test_presto("analytics");
        presto.spec.coordinator.node.cpu_request = cpu.map(str::to_string);
        presto
    }

    fn admission_request(operation: &str, old: Option<&Presto>, new: &Presto) -> AdmissionRequest<Presto> {
        let review: AdmissionReview<Presto> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "falarica.io", "version": "v1alpha1", "kind": "Presto"},
                "resource": {"group": "falarica.io", "version": "v1alpha1", "resource": "prestos"},
                "name": "analytics",
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": new,
                "oldObject": old,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn test_tls_config_from_pem_pair() {
        let generated = rcgen::generate_simple_self_signed(vec![
            "presto-operator.presto-system.svc".to_string(),
        ])
        .unwrap();
        let cert_pem = generated.cert.pem();
        let key_pem = generated.key_pair.serialize_pem();

        let config = tls_config(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_tls_config_rejects_missing_key() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = generated.cert.pem();

        let err = tls_config(cert_pem.as_bytes(), b"").unwrap_err();
        assert!(err.to_string().contains("No private key"));
        assert!(tls_config(b"", cert_pem.as_bytes()).is_err());
    }

    #[test]
    fn test_changed_cpu_request_is_denied() {
        let old = with_cpu_request(Some("1"));
        let new = with_cpu_request(Some("2"));

        let err = validate_update(&old, &new).unwrap_err();
        assert_eq!(err.to_string(), "spec.coordinator.cpuRequest: field is immutable");

        let response = review(&admission_request("UPDATE", Some(&old), &new));
        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            "spec.coordinator.cpuRequest: field is immutable"
        );
    }

    #[test]
    fn test_setting_cpu_request_is_denied() {
        let old = with_cpu_request(None);
        let new = with_cpu_request(Some("500m"));
        assert!(validate_update(&old, &new).is_err());
    }

    #[test]
    fn test_other_changes_are_allowed() {
        let old = with_cpu_request(Some("1"));
        let mut new = old.clone();
        new.spec.worker.count = 10;
        new.spec.coordinator.node.memory_limit = "16Gi".to_string();

        let response = review(&admission_request("UPDATE", Some(&old), &new));
        assert!(response.allowed);
    }

    #[test]
    fn test_create_is_allowed() {
        let new = with_cpu_request(Some("1"));
        let response = review(&admission_request("CREATE", None, &new));
        assert!(response.allowed);
    }
}
