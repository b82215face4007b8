// SPDX-License-Identifier: Apache-2.0

//! CA generation, leaf certificate issuance, and mutual-TLS config assembly
//! (spec §4.2).
//!
//! Grounded on `hipcheck/src/http/tls.rs`'s shape (a small function that
//! builds a ready-to-use `rustls` config from PEM material) but generalized
//! two ways: the teacher only ever trusts system roots for outbound calls,
//! while every config built here both trusts *and requires* a peer
//! certificate signed by the cluster's own CA, and certs are generated
//! in-process rather than loaded from disk (spec §1 explicitly places
//! "TLS certificate on-disk loading" out of this crate's scope).

use beskar_common::error::{Error, Result};
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
	IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
};
use rsa::pkcs8::EncodePrivateKey;
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};

/// The signing algorithm family for a CA and the leaves it issues (spec
/// §4.2: "RSA CA uses 4096-bit, leaf 2048-bit; ECDSA CA uses P-384, leaf
/// P-256.").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
	Rsa,
	Ecdsa,
}

/// A generated certificate/key pair, both PEM-encoded.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
	pub cert_pem: String,
	pub key_pem: String,
}

fn rsa_key_pair(bits: usize) -> Result<KeyPair> {
	let mut rng = rand_core::OsRng;
	let private_key = rsa::RsaPrivateKey::new(&mut rng, bits)
		.map_err(|e| Error::invalid_argument(format!("failed to generate RSA key: {e}")))?;
	let pkcs8_pem = private_key
		.to_pkcs8_pem(Default::default())
		.map_err(|e| Error::invalid_argument(format!("failed to encode RSA key: {e}")))?;
	KeyPair::from_pem(pkcs8_pem.as_str())
		.map_err(|e| Error::invalid_argument(format!("rcgen rejected generated RSA key: {e}")))
}

fn leaf_key_pair(alg: Algorithm) -> Result<KeyPair> {
	match alg {
		Algorithm::Rsa => rsa_key_pair(2048),
		Algorithm::Ecdsa => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
			.map_err(|e| Error::invalid_argument(format!("failed to generate ECDSA leaf key: {e}"))),
	}
}

fn ca_key_pair(alg: Algorithm) -> Result<KeyPair> {
	match alg {
		Algorithm::Rsa => rsa_key_pair(4096),
		Algorithm::Ecdsa => KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
			.map_err(|e| Error::invalid_argument(format!("failed to generate ECDSA CA key: {e}"))),
	}
}

fn not_after_from_duration(valid_for: TimeDuration) -> Result<OffsetDateTime> {
	if valid_for <= TimeDuration::ZERO {
		return Err(Error::invalid_argument("certificate validity duration must be positive"));
	}
	Ok(OffsetDateTime::now_utc() + valid_for)
}

fn common_name_params(cn: &str, not_after: OffsetDateTime) -> Result<CertificateParams> {
	if cn.is_empty() {
		return Err(Error::invalid_argument("certificate CN must not be empty"));
	}
	let mut params = CertificateParams::new(Vec::<String>::new())
		.map_err(|e| Error::invalid_argument(format!("invalid certificate params: {e}")))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, cn);
	params.distinguished_name = dn;
	params.not_after = not_after;
	Ok(params)
}

/// Generates a new self-signed CA certificate and key (spec §4.2
/// `GenerateCA`).
pub fn generate_ca(cn: &str, valid_for: TimeDuration, alg: Algorithm) -> Result<CertKeyPair> {
	let not_after = not_after_from_duration(valid_for)?;
	let mut params = common_name_params(cn, not_after)?;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	params.extended_key_usages = vec![
		ExtendedKeyUsagePurpose::ServerAuth,
		ExtendedKeyUsagePurpose::ClientAuth,
	];

	let key_pair = ca_key_pair(alg)?;
	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| Error::invalid_argument(format!("failed to self-sign CA cert: {e}")))?;

	Ok(CertKeyPair {
		cert_pem: cert.pem(),
		key_pem: key_pair.serialize_pem(),
	})
}

/// Issues a leaf certificate signed by the given CA (spec §4.2
/// `GenerateLeaf`). "Algorithm is inferred from the CA": the leaf key is
/// generated in the same family (RSA/ECDSA) as the CA key supplied.
pub fn generate_leaf(
	ca: &CertKeyPair,
	cn: &str,
	valid_for: TimeDuration,
	ips: &[IpAddr],
	dns_names: &[String],
) -> Result<CertKeyPair> {
	let ca_key_pair = KeyPair::from_pem(&ca.key_pem)
		.map_err(|e| Error::invalid_argument(format!("invalid CA key PEM: {e}")))?;
	let alg = if ca_key_pair.is_compatible(&PKCS_ECDSA_P384_SHA384)
		|| ca_key_pair.is_compatible(&PKCS_ECDSA_P256_SHA256)
	{
		Algorithm::Ecdsa
	} else {
		Algorithm::Rsa
	};

	let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem)
		.map_err(|e| Error::invalid_argument(format!("invalid CA cert PEM: {e}")))?;
	let ca_cert = ca_params
		.self_signed(&ca_key_pair)
		.map_err(|e| Error::invalid_argument(format!("failed to reconstruct CA cert: {e}")))?;

	let not_after = not_after_from_duration(valid_for)?;
	let mut params = common_name_params(cn, not_after)?;
	params.is_ca = IsCa::ExplicitNoCa;
	params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
	params.extended_key_usages = vec![
		ExtendedKeyUsagePurpose::ServerAuth,
		ExtendedKeyUsagePurpose::ClientAuth,
	];
	params.subject_alt_names = ips
		.iter()
		.map(|ip| SanType::IpAddress(*ip))
		.chain(dns_names.iter().cloned().map(SanType::DnsName).filter_map(|s| match s {
			SanType::DnsName(name) => rcgen::Ia5String::try_from(name).ok().map(SanType::DnsName),
			other => Some(other),
		}))
		.collect();

	let leaf_key_pair = leaf_key_pair(alg)?;
	let leaf_cert = params
		.signed_by(&leaf_key_pair, &ca_cert, &ca_key_pair)
		.map_err(|e| Error::invalid_argument(format!("failed to sign leaf cert: {e}")))?;

	Ok(CertKeyPair {
		cert_pem: leaf_cert.pem(),
		key_pem: leaf_key_pair.serialize_pem(),
	})
}

fn parse_cert_chain(pem: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
	rustls_pemfile::certs(&mut pem.as_bytes())
		.collect::<std::result::Result<Vec<_>, _>>()
		.map_err(|e| Error::invalid_argument(format!("invalid certificate PEM: {e}")))
}

fn parse_private_key(pem: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
	rustls_pemfile::private_key(&mut pem.as_bytes())
		.map_err(|e| Error::invalid_argument(format!("invalid private key PEM: {e}")))?
		.ok_or_else(|| Error::invalid_argument("no private key found in PEM"))
}

/// Builds a server-side TLS config that requires and verifies client
/// certificates, minimum TLS 1.3 (spec §4.2 `ServerTLSConfig`).
pub fn server_tls_config(ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<rustls::ServerConfig> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in parse_cert_chain(ca_pem)? {
		roots
			.add(cert)
			.map_err(|e| Error::invalid_argument(format!("invalid CA certificate: {e}")))?;
	}
	let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
		.build()
		.map_err(|e| Error::invalid_argument(format!("failed to build client verifier: {e}")))?;

	let cert_chain = parse_cert_chain(cert_pem)?;
	let key = parse_private_key(key_pem)?;

	let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.with_client_cert_verifier(client_verifier)
		.with_single_cert(cert_chain, key)
		.map_err(|e| Error::invalid_argument(format!("invalid server certificate/key: {e}")))?;

	Ok(config)
}

/// Extracts the subject common name from a DER-encoded peer certificate, as
/// handed back by `rustls::ServerConnection::peer_certificates()` once the
/// client-cert-verifying handshake has already validated the chain against
/// the cluster CA. Used to recover the verified peer identity the access
/// controller's mTLS bypass checks (spec §4.12, §6 "matching SNI bypasses
/// auth for intra-cluster peers").
pub fn peer_common_name(der: &[u8]) -> Result<String> {
	let (_, cert) = x509_parser::parse_x509_certificate(der)
		.map_err(|e| Error::invalid_argument(format!("invalid peer certificate DER: {e}")))?;
	cert.subject()
		.iter_common_name()
		.next()
		.and_then(|cn| cn.as_str().ok())
		.map(|s| s.to_string())
		.ok_or_else(|| Error::invalid_argument("peer certificate has no common name"))
}

/// Builds a client-side TLS config trusting the cluster CA and presenting
/// its own leaf certificate for mutual auth (spec §4.2 `ClientTLSConfig`).
pub fn client_tls_config(ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in parse_cert_chain(ca_pem)? {
		roots
			.add(cert)
			.map_err(|e| Error::invalid_argument(format!("invalid CA certificate: {e}")))?;
	}

	let cert_chain = parse_cert_chain(cert_pem)?;
	let key = parse_private_key(key_pem)?;

	let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.with_root_certificates(roots)
		.with_client_auth_cert(cert_chain, key)
		.map_err(|e| Error::invalid_argument(format!("invalid client certificate/key: {e}")))?;

	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_ecdsa_ca_and_leaf() {
		let ca = generate_ca("beskar-test-ca", TimeDuration::days(365), Algorithm::Ecdsa).unwrap();
		assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));

		let leaf = generate_leaf(
			&ca,
			"node-a.beskar.internal",
			TimeDuration::hours(24),
			&[],
			&["node-a.beskar.internal".to_string()],
		)
		.unwrap();
		assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
	}

	#[test]
	fn generates_rsa_ca_and_leaf() {
		let ca = generate_ca("beskar-test-rsa-ca", TimeDuration::days(365), Algorithm::Rsa).unwrap();
		let leaf = generate_leaf(&ca, "node-b", TimeDuration::hours(24), &[], &["node-b".to_string()]);
		assert!(leaf.is_ok());
	}

	#[test]
	fn rejects_empty_cn() {
		let err = generate_ca("", TimeDuration::days(1), Algorithm::Ecdsa).unwrap_err();
		assert_eq!(err.kind(), beskar_common::ErrorKind::InvalidArgument);
	}

	#[test]
	fn rejects_non_positive_validity() {
		let err = generate_ca("cn", TimeDuration::ZERO, Algorithm::Ecdsa).unwrap_err();
		assert_eq!(err.kind(), beskar_common::ErrorKind::InvalidArgument);
	}

	#[test]
	fn peer_common_name_recovers_the_leaf_cn() {
		let ca = generate_ca("beskar-test-ca", TimeDuration::days(365), Algorithm::Ecdsa).unwrap();
		let leaf = generate_leaf(&ca, "node-b.beskar.internal", TimeDuration::hours(1), &[], &["node-b.beskar.internal".into()]).unwrap();

		let der = parse_cert_chain(&leaf.cert_pem).unwrap();
		let cn = peer_common_name(der[0].as_ref()).unwrap();
		assert_eq!(cn, "node-b.beskar.internal");
	}

	#[test]
	fn server_and_client_configs_build_from_generated_material() {
		let ca = generate_ca("beskar-test-ca", TimeDuration::days(365), Algorithm::Ecdsa).unwrap();
		let server_leaf = generate_leaf(&ca, "server", TimeDuration::hours(1), &[], &["server".into()]).unwrap();
		let client_leaf = generate_leaf(&ca, "client", TimeDuration::hours(1), &[], &["client".into()]).unwrap();

		server_tls_config(&ca.cert_pem, &server_leaf.cert_pem, &server_leaf.key_pem).unwrap();
		client_tls_config(&ca.cert_pem, &client_leaf.cert_pem, &client_leaf.key_pem).unwrap();
	}
}
