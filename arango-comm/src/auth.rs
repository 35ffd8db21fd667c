use crate::vpack::{self, Value};
use base64::prelude::*;
use bytes::Bytes;
use derivative::Derivative;
use serde::Deserialize;

/// Credentials used to authenticate every connection.
///
/// The secret fields are never included in `Debug` output.
#[derive(Clone, Derivative, Deserialize, PartialEq, Eq)]
#[derivative(Debug)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMethod {
    Basic {
        user: String,
        #[derivative(Debug = "ignore")]
        password: String,
    },
    Jwt {
        user: String,
        #[derivative(Debug = "ignore")]
        jwt: String,
    },
}

impl AuthenticationMethod {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        AuthenticationMethod::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn jwt(user: impl Into<String>, jwt: impl Into<String>) -> Self {
        AuthenticationMethod::Jwt {
            user: user.into(),
            jwt: jwt.into(),
        }
    }

    pub fn user(&self) -> &str {
        match self {
            AuthenticationMethod::Basic { user, .. } => user,
            AuthenticationMethod::Jwt { user, .. } => user,
        }
    }

    /// Value of the `authorization` header sent with every HTTP request.
    pub fn http_authorization_header(&self) -> String {
        match self {
            AuthenticationMethod::Basic { user, password } => {
                format!("Basic {}", BASE64_STANDARD.encode(format!("{user}:{password}")))
            }
            AuthenticationMethod::Jwt { jwt, .. } => format!("Bearer {jwt}"),
        }
    }

    /// The VelocyStream authentication message, sent once right after the protocol handshake.
    pub fn vst_authentication_message(&self) -> Bytes {
        let value = match self {
            AuthenticationMethod::Basic { user, password } => Value::Array(vec![
                Value::Int(1),
                Value::Int(1000),
                Value::from("plain"),
                Value::from(user.as_str()),
                Value::from(password.as_str()),
            ]),
            AuthenticationMethod::Jwt { jwt, .. } => Value::Array(vec![
                Value::Int(1),
                Value::Int(1000),
                Value::from("jwt"),
                Value::from(jwt.as_str()),
            ]),
        };
        vpack::encode(&value)
    }
}
