use crate::*;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Period during which generated keys are valid
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ValidityWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Key creation request broadcast to every node. Immutable once published.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyCreationRequest {
    pub correlation_id: Uuid,
    pub election_event_id: String,
    pub resource_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub encryption_parameters: String,
    pub request_id: String,
}

impl KeyCreationRequest {
    /// Create a request with a fresh correlation id
    pub fn new(
        election_event_id: &str,
        resource_id: &str,
        validity: ValidityWindow,
        encryption_parameters: &str,
        tracking_id: &str,
    ) -> Self {
        KeyCreationRequest {
            correlation_id: Uuid::new_v4(),
            election_event_id: election_event_id.to_owned(),
            resource_id: resource_id.to_owned(),
            from: validity.from,
            to: validity.to,
            encryption_parameters: encryption_parameters.to_owned(),
            request_id: tracking_id.to_owned(),
        }
    }

    pub fn validity(&self) -> ValidityWindow {
        ValidityWindow {
            from: self.from,
            to: self.to,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A public key generated by one node, signed by that node
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CcPublicKey {
    /// Serialized public key, opaque here
    pub public_key: String,
    #[serde(with = "base64_bytes")]
    pub key_signature: Vec<u8>,
    /// PEM
    pub signer_certificate: String,
    /// PEM
    pub node_ca_certificate: String,
}

/// One node's reply to a [`KeyCreationRequest`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyContribution {
    pub correlation_id: Uuid,
    pub election_event_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub public_keys: Vec<CcPublicKey>,
}

impl KeyContribution {
    /// Decode a contribution sent as JSON or CBOR
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_message(bytes)
    }

    /// Package the public key at `index` as an independent artifact
    pub fn package(&self, index: usize) -> Result<PackagedContribution, Error> {
        let key = self
            .public_keys
            .get(index)
            .ok_or(Error::MissingPublicKey(index))?;

        Ok(PackagedContribution {
            public_key: key.public_key.clone(),
            signature: key.key_signature.clone(),
            signer_certificate: key.signer_certificate.clone(),
            node_ca_certificate: key.node_ca_certificate.clone(),
        })
    }
}

/// A single node's public key share, packaged for downstream consumers.
///
/// Contributions are never combined here; each one is handed over as is.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackagedContribution {
    pub public_key: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub signer_certificate: String,
    #[serde(rename = "nodeCACertificate")]
    pub node_ca_certificate: String,
}

impl PackagedContribution {
    /// `{publicKey, signature, signerCertificate, nodeCACertificate}` with a base64 signature
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Only the correlation id of a contribution, enough to route it to its waiter
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ContributionHeader {
    pub correlation_id: Uuid,
}

/// Decode a message that is either JSON or CBOR
pub fn decode_message<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    // If it starts with `{` then it's JSON
    match bytes.first() {
        None => Err(CodecError::EmptyMessage),
        Some(b'{') => Ok(serde_json::from_slice(bytes)?),
        Some(_) => Ok(serde_cbor::from_slice(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contribution(correlation_id: Uuid, node: &str) -> KeyContribution {
        let key = |kind: &str| CcPublicKey {
            public_key: format!("{{\"{}\":\"{}\"}}", kind, node),
            key_signature: node.as_bytes().to_vec(),
            signer_certificate: format!("-----BEGIN CERTIFICATE-----\n{}\n", node),
            node_ca_certificate: "-----BEGIN CERTIFICATE-----\nca\n".to_owned(),
        };
        KeyContribution {
            correlation_id,
            election_event_id: "ee".to_owned(),
            resource_id: "ea".to_owned(),
            node_id: Some(node.to_owned()),
            public_keys: vec![key("generation"), key("decryption")],
        }
    }

    #[test]
    fn each_request_gets_a_fresh_correlation_id() {
        let validity = ValidityWindow {
            from: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap(),
        };
        let a = KeyCreationRequest::new("ee", "ea", validity, "{}", "t");
        let b = KeyCreationRequest::new("ee", "ea", validity, "{}", "t");
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.validity(), validity);

        let json: serde_json::Value = serde_json::from_slice(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(json["resourceId"], "ea");
        assert_eq!(json["requestId"], "t");
    }

    #[test]
    fn contributions_decode_from_json_and_cbor() {
        let original = contribution(Uuid::new_v4(), "node1");

        let json = serde_json::to_vec(&original).unwrap();
        assert_eq!(KeyContribution::from_bytes(&json).unwrap(), original);

        let cbor = serde_cbor::to_vec(&original).unwrap();
        assert_eq!(KeyContribution::from_bytes(&cbor).unwrap(), original);

        assert!(matches!(
            KeyContribution::from_bytes(&[]),
            Err(CodecError::EmptyMessage)
        ));
    }

    #[test]
    fn packaging_picks_one_key_and_keeps_it_independent() {
        let contribution = contribution(Uuid::new_v4(), "node2");

        let packaged = contribution.package(1).unwrap();
        assert_eq!(packaged.public_key, "{\"decryption\":\"node2\"}");

        let json: serde_json::Value = serde_json::from_str(&packaged.to_json().unwrap()).unwrap();
        assert_eq!(json["signature"], "bm9kZTI=");
        assert!(json["nodeCACertificate"].is_string());
        assert!(json["signerCertificate"].is_string());

        assert!(matches!(
            contribution.package(2),
            Err(Error::MissingPublicKey(2))
        ));
    }
}
