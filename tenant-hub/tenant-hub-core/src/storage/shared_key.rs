//! Shared Key request signing for the storage REST API.

use super::StorageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use ring::hmac;
use std::collections::BTreeMap;

/// Standard headers covered by the signature, in signing order.
const SIGNED_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

pub(crate) struct SharedKeyCredential {
    account: String,
    key: hmac::Key,
}

impl std::fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl SharedKeyCredential {
    pub(crate) fn new(account: &str, account_key: &str) -> Result<Self, StorageError> {
        let bytes = STANDARD.decode(account_key.trim()).map_err(|_| {
            StorageError::Configuration("storageAccountKey is not valid base64".to_string())
        })?;
        Ok(Self {
            account: account.to_string(),
            key: hmac::Key::new(hmac::HMAC_SHA256, &bytes),
        })
    }

    /// Value for the `Authorization` header.
    pub(crate) fn authorization(&self, method: &Method, url: &Url, headers: &HeaderMap) -> String {
        let payload = self.string_to_sign(method, url, headers);
        let signature = hmac::sign(&self.key, payload.as_bytes());
        format!("SharedKey {}:{}", self.account, STANDARD.encode(signature.as_ref()))
    }

    pub(crate) fn string_to_sign(&self, method: &Method, url: &Url, headers: &HeaderMap) -> String {
        let mut out = String::new();
        out.push_str(method.as_str());
        out.push('\n');
        for name in SIGNED_HEADERS {
            let value = header_value(headers, name);
            // a zero length is signed as empty
            if name == "content-length" && value == "0" {
                out.push('\n');
                continue;
            }
            out.push_str(value);
            out.push('\n');
        }

        let mut ms_headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let name = name.as_str().to_ascii_lowercase();
            if name.starts_with("x-ms-") {
                let value = value.to_str().unwrap_or_default().trim().to_string();
                ms_headers.insert(name, value);
            }
        }
        for (name, value) in &ms_headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }

        out.push('/');
        out.push_str(&self.account);
        out.push_str(url.path());

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            out.push('\n');
            out.push_str(&name);
            out.push(':');
            out.push_str(&values.join(","));
        }
        out
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
