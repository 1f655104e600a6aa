//! PEM decoding and private key canonicalisation
//!
//! The device only accepts PKCS#8 private keys. The agent writes EC keys in
//! SEC1 form and RSA keys in PKCS#1 form, so both are rewrapped here.

use certpilot_core::{Error, Result};
use pkcs8::der::asn1::AnyRef;
use pkcs8::der::{Decode, Encode, pem};
use pkcs8::{AlgorithmIdentifierRef, ObjectIdentifier, PrivateKeyInfo};

/// `id-ecPublicKey` (RFC 5480)
const EC_PUBLIC_KEY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// `rsaEncryption` (RFC 8017)
const RSA_ENCRYPTION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// A decoded PEM block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    /// Label from the `BEGIN` line, e.g. `EC PRIVATE KEY`
    pub label: String,
    /// DER contents
    pub der: Vec<u8>,
}

/// Decode the first PEM block in `text`
///
/// Trailing blocks (the rest of a chain) are ignored.
pub fn first_pem_block(text: &str) -> Result<PemBlock> {
    let start = text
        .find("-----BEGIN ")
        .ok_or_else(|| Error::parse("no PEM block found"))?;
    let rest = &text[start..];

    let label_end = rest["-----BEGIN ".len()..]
        .find("-----")
        .ok_or_else(|| Error::parse("malformed PEM header"))?;
    let label = &rest["-----BEGIN ".len().."-----BEGIN ".len() + label_end];

    let footer = format!("-----END {label}-----");
    let end = rest
        .find(&footer)
        .ok_or_else(|| Error::parse(format!("missing PEM footer for {label}")))?
        + footer.len();

    let (decoded_label, der) =
        pem::decode_vec(rest[..end].as_bytes()).map_err(|e| Error::parse(e.to_string()))?;

    Ok(PemBlock {
        label: decoded_label.to_string(),
        der,
    })
}

/// Convert a private key block to PKCS#8 DER
///
/// - `EC PRIVATE KEY`: SEC1, rewrapped with its named curve
/// - `RSA PRIVATE KEY`: PKCS#1, rewrapped as `rsaEncryption`
/// - `PRIVATE KEY`: already PKCS#8, returned as-is
pub fn to_pkcs8(block: &PemBlock) -> Result<Vec<u8>> {
    match block.label.as_str() {
        "EC PRIVATE KEY" => sec1_to_pkcs8(&block.der),
        "RSA PRIVATE KEY" => pkcs1_to_pkcs8(&block.der),
        "PRIVATE KEY" => {
            PrivateKeyInfo::from_der(&block.der).map_err(|e| Error::parse(e.to_string()))?;
            Ok(block.der.clone())
        }
        other => Err(Error::unsupported_key(other)),
    }
}

fn sec1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>> {
    let key = sec1::EcPrivateKey::try_from(der).map_err(|e| Error::parse(e.to_string()))?;
    let curve = key
        .parameters
        .and_then(|p| p.named_curve())
        .ok_or_else(|| Error::unsupported_key("EC key without a named curve"))?;

    // The curve moves into the algorithm identifier
    let inner = sec1::EcPrivateKey {
        private_key: key.private_key,
        parameters: None,
        public_key: key.public_key,
    }
    .to_der()
    .map_err(|e| Error::parse(e.to_string()))?;

    let algorithm = AlgorithmIdentifierRef {
        oid: EC_PUBLIC_KEY_OID,
        parameters: Some(AnyRef::from(&curve)),
    };
    encode_private_key_info(algorithm, &inner)
}

fn pkcs1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>> {
    pkcs1::RsaPrivateKey::try_from(der).map_err(|e| Error::parse(e.to_string()))?;

    let algorithm = AlgorithmIdentifierRef {
        oid: RSA_ENCRYPTION_OID,
        parameters: Some(AnyRef::NULL),
    };
    encode_private_key_info(algorithm, der)
}

fn encode_private_key_info(algorithm: AlgorithmIdentifierRef<'_>, private_key: &[u8]) -> Result<Vec<u8>> {
    PrivateKeyInfo::new(algorithm, private_key)
        .to_der()
        .map_err(|e| Error::parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::pkcs8::DecodePrivateKey;

    // openssl genrsa -traditional 1024
    const RSA_PKCS1: &str = include_str!("../tests/fixtures/rsa_pkcs1.pem");

    #[test]
    fn ec_key_signs_identically_after_conversion() {
        let original = p256::SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pem = original.to_sec1_pem(Default::default()).unwrap();

        let block = first_pem_block(&pem).unwrap();
        assert_eq!(block.label, "EC PRIVATE KEY");
        let der = to_pkcs8(&block).unwrap();

        let converted = p256::SecretKey::from_pkcs8_der(&der).expect("valid PKCS#8");
        assert_eq!(converted.to_bytes(), original.to_bytes());

        // ECDSA over P-256 here is RFC 6979 deterministic
        let message = b"certificate installer";
        let a: Signature = SigningKey::from(&original).sign(message);
        let b: Signature = SigningKey::from(&converted).sign(message);
        assert_eq!(a, b);
    }

    #[test]
    fn rsa_key_is_wrapped() {
        let block = first_pem_block(RSA_PKCS1).unwrap();
        assert_eq!(block.label, "RSA PRIVATE KEY");

        let der = to_pkcs8(&block).unwrap();
        let info = PrivateKeyInfo::from_der(&der).unwrap();
        assert_eq!(info.algorithm.oid, RSA_ENCRYPTION_OID);
        assert_eq!(info.private_key, block.der.as_slice());
    }

    #[test]
    fn pkcs8_passes_through() {
        let key = rcgen::KeyPair::generate().unwrap();
        let block = first_pem_block(&key.serialize_pem()).unwrap();
        assert_eq!(block.label, "PRIVATE KEY");
        assert_eq!(to_pkcs8(&block).unwrap(), block.der);
    }

    #[test]
    fn unknown_label_is_unsupported() {
        let block = PemBlock {
            label: "ENCRYPTED PRIVATE KEY".to_string(),
            der: vec![0x30, 0x00],
        };
        let err = to_pkcs8(&block).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKey(ref k) if k == "ENCRYPTED PRIVATE KEY"));
    }

    #[test]
    fn first_block_of_chain() {
        let leaf = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let other = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let chain = format!("{leaf}\n{other}");
        assert_eq!(
            first_pem_block(&chain).unwrap(),
            first_pem_block(&leaf).unwrap()
        );
    }

    #[test]
    fn garbage_is_parse_error() {
        assert!(matches!(first_pem_block("not pem"), Err(Error::Parse(_))));
        assert!(matches!(
            first_pem_block("-----BEGIN CERTIFICATE-----\nAAAA\n"),
            Err(Error::Parse(_))
        ));
    }
}
