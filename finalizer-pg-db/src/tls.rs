// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use diesel::{ConnectionError, ConnectionResult};
use diesel_async::AsyncPgConnection;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use rustls_pki_types::CertificateDer;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::error;
use webpki_roots::TLS_SERVER_ROOTS;

// Accepts any server certificate, like libpq does unless `sslmode=verify-*` is requested.
#[derive(Debug)]
struct SkipServerCertCheck;

impl ServerCertVerifier for SkipServerCertCheck {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

// Connect through tokio-postgres with a rustls connector and hand the client to diesel-async,
// which has no TLS settings of its own. Whether TLS is actually used is negotiated with the
// server and the URL's `sslmode`: `disable` never attempts it, the default `prefer` falls back to
// plaintext when the server refuses, `require` fails instead.
pub async fn establish_tls_connection(
    database_url: &str,
    tls_config: ClientConfig,
) -> ConnectionResult<AsyncPgConnection> {
    let tls = MakeRustlsConnect::new(tls_config);
    let (client, conn) = tokio_postgres::connect(database_url, tls)
        .await
        .map_err(|e| ConnectionError::BadConnection(e.to_string()))?;

    // Drives the socket until the client is dropped or the connection fails
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!("Session database connection terminated: {e}");
        }
    });

    AsyncPgConnection::try_from(client).await
}

// Without `tls_verify_cert` the server certificate is not checked. Otherwise it must chain to the
// Mozilla roots or to the extra CA in `tls_ca_cert_path` (PEM or DER).
pub fn build_tls_config(
    tls_verify_cert: bool,
    tls_ca_cert_path: Option<&Path>,
) -> anyhow::Result<ClientConfig> {
    if !tls_verify_cert {
        return Ok(ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerCertCheck))
            .with_no_client_auth());
    }

    let mut roots = root_certs();
    if let Some(path) = tls_ca_cert_path {
        for cert in read_ca_certs(path)? {
            roots
                .add(&Certificate(cert.to_vec()))
                .with_context(|| format!("Invalid CA certificate in {}", path.display()))?;
        }
    }

    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn read_ca_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read CA certificate from {}", path.display()))?;
    if bytes.starts_with(b"-----BEGIN") {
        rustls_pemfile::certs(&mut bytes.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse PEM certificates from {}", path.display()))
    } else {
        Ok(vec![CertificateDer::from(bytes)])
    }
}

fn root_certs() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.to_vec(),
            ta.subject_public_key_info.to_vec(),
            ta.name_constraints.as_ref().map(|nc| nc.to_vec()),
        )
    }));
    roots
}
