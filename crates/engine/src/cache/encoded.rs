//! Lossless serde form for OS paths and file names
//!
//! Valid UTF-8 is written as a plain string. Anything else is written as
//! `{"raw": "<base64 of the OS bytes>"}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::{OsStr, OsString};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum Encoded {
    Text(String),
    Raw { raw: String },
}

pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<OsStr>,
    S: Serializer,
{
    let value = value.as_ref();
    let encoded = match value.to_str() {
        Some(text) => Encoded::Text(text.to_owned()),
        None => Encoded::Raw {
            raw: BASE64.encode(os_bytes(value)),
        },
    };
    encoded.serialize(serializer)
}

pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: From<OsString>,
    D: Deserializer<'de>,
{
    match Encoded::deserialize(deserializer)? {
        Encoded::Text(text) => Ok(OsString::from(text).into()),
        Encoded::Raw { raw } => {
            let bytes = BASE64.decode(raw).map_err(D::Error::custom)?;
            Ok(os_string(bytes).into())
        }
    }
}

#[cfg(unix)]
fn os_bytes(value: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    value.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(value: &OsStr) -> Vec<u8> {
    value.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn os_string(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn os_string(bytes: Vec<u8>) -> OsString {
    String::from_utf8_lossy(&bytes).into_owned().into()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStrExt;
    use std::path::PathBuf;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Named {
        #[serde(with = "super")]
        path: PathBuf,
    }

    #[test]
    fn utf8_paths_stay_plain_strings() {
        let named = Named {
            path: PathBuf::from("/srv/média/a.bin"),
        };
        let json = serde_json::to_string(&named).unwrap();
        assert_eq!(json, r#"{"path":"/srv/média/a.bin"}"#);
        assert_eq!(serde_json::from_str::<Named>(&json).unwrap(), named);
    }

    #[test]
    fn non_utf8_paths_round_trip_as_raw_bytes() {
        let named = Named {
            path: PathBuf::from(OsStr::from_bytes(b"/srv/d\xff/caf\xe9.bin")),
        };
        let json = serde_json::to_string(&named).unwrap();
        assert!(json.contains(r#""raw":"#), "{}", json);
        assert_eq!(serde_json::from_str::<Named>(&json).unwrap(), named);
    }
}
