//! Backend TLS (spec §3 `HTTPProxyConfig.tlsInsecureSkipVerify`/`tlsServerName`):
//! builds the `rustls::ClientConfig` used to reach `https://`/`wss://` nodes.
//! Grounded on the teacher fork's `transport::tls` module (crypto provider
//! selection, `insecure::NoVerifier` for skip-verify) since the primary
//! teacher's own copy of that module isn't present in this pack.

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

use crate::config::HTTPProxyConfig;

/// Builds the client-side TLS config for dialing backend nodes. Honors
/// `tlsInsecureSkipVerify` by swapping in [`insecure::NoVerifier`]; SNI
/// override (`tlsServerName`) is applied by the caller when it picks the
/// [`rustls_pki_types::ServerName`] to hand to the handshake, not here.
pub fn client_config(cfg: &HTTPProxyConfig) -> ClientConfig {
	let mut roots = RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}

	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
	let mut config = ClientConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()
		.expect("aws_lc_rs provider supports the default TLS versions")
		.with_root_certificates(roots)
		.with_no_client_auth();

	if cfg.tls_insecure_skip_verify {
		config.dangerous().set_certificate_verifier(Arc::new(insecure::NoVerifier));
	}

	config
}

/// Resolves the SNI name the handshake should present: `tlsServerName` if
/// set, otherwise the node's own host.
pub fn server_name(cfg: &HTTPProxyConfig, host: &str) -> Result<rustls_pki_types::ServerName<'static>, rustls_pki_types::InvalidDnsNameError> {
	let name = cfg.tls_server_name.clone().unwrap_or_else(|| host.to_string());
	rustls_pki_types::ServerName::try_from(name)
}

pub mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::{DigitallySignedStruct, SignatureScheme};

	/// Accepts any server certificate. Only reachable when an operator sets
	/// `tlsInsecureSkipVerify`, which is an explicit per-service opt-out.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA1,
				SignatureScheme::ECDSA_SHA1_Legacy,
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
				SignatureScheme::ED448,
			]
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg(insecure: bool, server_name: Option<&str>) -> HTTPProxyConfig {
		let mut cfg = crate::config::decode(&Default::default()).unwrap();
		cfg.tls_insecure_skip_verify = insecure;
		cfg.tls_server_name = server_name.map(str::to_string);
		cfg
	}

	#[test]
	fn server_name_defaults_to_host() {
		let name = server_name(&cfg(false, None), "backend.internal").unwrap();
		assert_eq!(format!("{name:?}"), format!("{:?}", rustls_pki_types::ServerName::try_from("backend.internal").unwrap()));
	}

	#[test]
	fn server_name_honors_override() {
		let name = server_name(&cfg(false, Some("override.example")), "backend.internal").unwrap();
		assert_eq!(format!("{name:?}"), format!("{:?}", rustls_pki_types::ServerName::try_from("override.example").unwrap()));
	}
}
