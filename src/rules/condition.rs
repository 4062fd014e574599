use std::net::SocketAddr;

use axum::{body::Body, extract::ConnectInfo, http::Request};
use bytes::Bytes;
use http_body_util::BodyExt;
use ipnet::IpNet;
use regex::Regex;

use crate::error::StateraError;

/// Condition types: which part of the request is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Path,
    Query,
    BodyString,
    BodyForm,
    Header,
    Ip,
}

impl TryFrom<u8> for ConditionKind {
    type Error = anyhow::Error;

    fn try_from(code: u8) -> anyhow::Result<Self> {
        Ok(match code {
            0 => ConditionKind::Path,
            1 => ConditionKind::Query,
            2 => ConditionKind::BodyString,
            3 => ConditionKind::BodyForm,
            4 => ConditionKind::Header,
            5 => ConditionKind::Ip,
            other => anyhow::bail!("unknown condition type code {}", other),
        })
    }
}

/// Condition operations: how the value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Equal,
    BeginWith,
    Regex,
    Range,
}

impl TryFrom<u8> for ConditionOp {
    type Error = anyhow::Error;

    fn try_from(code: u8) -> anyhow::Result<Self> {
        Ok(match code {
            0 => ConditionOp::Equal,
            1 => ConditionOp::BeginWith,
            2 => ConditionOp::Regex,
            3 => ConditionOp::Range,
            other => anyhow::bail!("unknown condition operation code {}", other),
        })
    }
}

/// One clause of a rule's predicate.
#[derive(Debug, Clone)]
pub struct Condition {
    /// Negates the condition result.
    pub not: bool,
    pub kind: ConditionKind,
    /// The key that will be compared, on types that have keys.
    pub key: String,
    pub op: ConditionOp,
    pub value: String,
}

/// Case-insensitive string comparison for the Equal, BeginWith and Regex
/// operations. Regex uses find-first semantics: the pattern matches anywhere
/// in the input.
fn compare_str(op: ConditionOp, input: &str, value: &str) -> Result<bool, StateraError> {
    let input = input.to_lowercase();
    let value = value.to_lowercase();
    match op {
        ConditionOp::Equal => Ok(input == value),
        ConditionOp::BeginWith => Ok(input.starts_with(&value)),
        ConditionOp::Regex => Ok(Regex::new(&value)?.is_match(&input)),
        ConditionOp::Range => Err(StateraError::InvalidOperation),
    }
}

/// Buffers the whole request body and puts an equivalent body back in place,
/// so downstream forwarding still sees it.
async fn buffer_body(req: &mut Request<Body>) -> Result<Bytes, StateraError> {
    let body = std::mem::replace(req.body_mut(), Body::empty());
    let bytes = body
        .collect()
        .await
        .map_err(|e| StateraError::BodyRead(e.to_string()))?
        .to_bytes();
    *req.body_mut() = Body::from(bytes.clone());
    Ok(bytes)
}

/// First value for `key` in an urlencoded pair list, if present.
fn first_value(encoded: &str, key: &str) -> Result<Option<String>, StateraError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(encoded)?;
    Ok(pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v))
}

/// Evaluate a single condition against the request. Body conditions consume
/// and restore the request body. The outcome is XOR'd with `not`.
pub async fn evaluate(req: &mut Request<Body>, cond: &Condition) -> Result<bool, StateraError> {
    let outcome = match cond.kind {
        ConditionKind::Path => compare_str(cond.op, req.uri().path(), &cond.value)?,
        ConditionKind::Query => {
            match first_value(req.uri().query().unwrap_or(""), &cond.key)? {
                Some(value) => compare_str(cond.op, &value, &cond.value)?,
                None => false,
            }
        }
        ConditionKind::Header => match req.headers().get(cond.key.as_str()) {
            Some(value) => {
                compare_str(cond.op, &String::from_utf8_lossy(value.as_bytes()), &cond.value)?
            }
            None => false,
        },
        ConditionKind::BodyString => {
            let body = buffer_body(req).await?;
            compare_str(cond.op, &String::from_utf8_lossy(&body), &cond.value)?
        }
        ConditionKind::BodyForm => {
            let body = buffer_body(req).await?;
            let form = std::str::from_utf8(&body)
                .map_err(|e| StateraError::BodyRead(e.to_string()))?;
            match first_value(form, &cond.key)? {
                Some(value) => compare_str(cond.op, &value, &cond.value)?,
                None => false,
            }
        }
        ConditionKind::Ip => {
            if cond.op != ConditionOp::Range {
                return Err(StateraError::InvalidOperation);
            }
            let net: IpNet = cond.value.parse()?;
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .ok_or(StateraError::MissingClientAddr)?;
            net.contains(&peer.0.ip())
        }
    };
    Ok(outcome != cond.not)
}
