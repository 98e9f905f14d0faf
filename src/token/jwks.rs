use super::es256::{ALG, Error};
use base64ct::{Base64UrlUnpadded, Encoding};
use p256::{EncodedPoint, FieldBytes, ecdsa::VerifyingKey};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const COORDINATE_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// An EC P-256 public key in JWK form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    pub kid: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    #[must_use]
    pub fn from_verifying_key(key: &VerifyingKey, kid: impl Into<String>) -> Self {
        let point = key.to_encoded_point(false);
        let coordinate = |c: Option<&FieldBytes>| {
            c.map(|bytes| Base64UrlUnpadded::encode_string(bytes))
                .unwrap_or_default()
        };
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            alg: Some(ALG.to_string()),
            key_use: Some("sig".to_string()),
            kid: kid.into(),
            x: coordinate(point.x()),
            y: coordinate(point.y()),
        }
    }

    /// Convert this JWK back into a verifying key.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadToken` if the key type is not EC P-256 or the point is invalid.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, Error> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(Error::BadToken);
        }
        let x = Base64UrlUnpadded::decode_vec(&self.x).map_err(|_| Error::BadToken)?;
        let y = Base64UrlUnpadded::decode_vec(&self.y).map_err(|_| Error::BadToken)?;
        if x.len() != COORDINATE_LEN || y.len() != COORDINATE_LEN {
            return Err(Error::BadToken);
        }
        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&x),
            FieldBytes::from_slice(&y),
            false,
        );
        VerifyingKey::from_encoded_point(&point).map_err(|_| Error::BadToken)
    }
}
