//! The three API operations: decrypt_signature, get_sts, resolve_url.
//!
//! Handlers receive parsed request bodies, normalize and validate the
//! player URL, and compose the orchestrator's caches and solvers into the
//! response shapes. HTTP concerns (auth, status codes, headers) stay in the
//! transport layer.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::Url;

use ytcipher_common::player_url::{normalize_player_url, player_id_label};
use ytcipher_common::CipherError;

use crate::orchestrator::SolverOrchestrator;
use crate::runtime::SolverSet;

/// Query key used for the decrypted signature when the client names none.
const DEFAULT_SIGNATURE_KEY: &str = "sig";

/// Characters escaped in rebuilt query components. Deliberately minimal:
/// decrypted signatures must survive the round trip byte-for-byte wherever
/// the URL grammar allows it.
const QUERY_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?');

#[derive(Debug, Deserialize)]
pub struct DecryptSignatureRequest {
    pub player_url: String,
    #[serde(default)]
    pub encrypted_signature: Option<String>,
    #[serde(default)]
    pub n_param: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DecryptSignatureResponse {
    pub decrypted_signature: String,
    pub decrypted_n_sig: String,
}

#[derive(Debug, Deserialize)]
pub struct GetStsRequest {
    pub player_url: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct GetStsResponse {
    pub sts: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveUrlRequest {
    pub stream_url: String,
    pub player_url: String,
    #[serde(default)]
    pub encrypted_signature: Option<String>,
    #[serde(default)]
    pub signature_key: Option<String>,
    #[serde(default)]
    pub n_param: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ResolveUrlResponse {
    pub resolved_url: String,
}

pub async fn decrypt_signature(
    orchestrator: &SolverOrchestrator,
    req: DecryptSignatureRequest,
) -> Result<DecryptSignatureResponse, CipherError> {
    let player_url = normalize_player_url(&req.player_url)?;
    ytcipher_metrics::record_player_url_request(player_id_label(&player_url));

    let solvers = orchestrator.solvers_for(&player_url).await?;

    let mut decrypted_signature = String::new();
    let mut decrypted_n_sig = String::new();

    if let Some(set) = &solvers {
        if let Some(sig) = non_empty(req.encrypted_signature.as_deref()) {
            if set.has_sig_solver() {
                decrypted_signature = set.solve_sig(sig)?;
            }
        }
        if let Some(n) = non_empty(req.n_param.as_deref()) {
            if set.has_n_solver() {
                decrypted_n_sig = set.solve_n(n)?;
            }
        }
    }

    Ok(DecryptSignatureResponse {
        decrypted_signature,
        decrypted_n_sig,
    })
}

/// Returns the sts string and whether it came from cache; the transport
/// layer turns the flag into the `X-Cache-Hit` header.
pub async fn get_sts(
    orchestrator: &SolverOrchestrator,
    req: GetStsRequest,
) -> Result<(GetStsResponse, bool), CipherError> {
    let player_url = normalize_player_url(&req.player_url)?;
    ytcipher_metrics::record_player_url_request(player_id_label(&player_url));

    let (sts, cache_hit) = orchestrator.sts_for(&player_url).await?;
    Ok((GetStsResponse { sts }, cache_hit))
}

pub async fn resolve_url(
    orchestrator: &SolverOrchestrator,
    req: ResolveUrlRequest,
) -> Result<ResolveUrlResponse, CipherError> {
    let player_url = normalize_player_url(&req.player_url)?;
    ytcipher_metrics::record_player_url_request(player_id_label(&player_url));

    let mut stream_url = Url::parse(&req.stream_url)
        .map_err(|e| CipherError::Validation(format!("invalid stream_url: {e}")))?;

    let solvers = orchestrator.solvers_for(&player_url).await?;

    // The n parameter may arrive in the body or ride along in the stream
    // URL's query; capture it before the query is rewritten.
    let n_param = non_empty(req.n_param.as_deref())
        .map(str::to_owned)
        .or_else(|| query_value(&stream_url, "n"));

    let mut pairs: Vec<(String, String)> = stream_url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut modified = false;

    if let Some(encrypted) = non_empty(req.encrypted_signature.as_deref()) {
        let set = sig_capable(&solvers).ok_or(CipherError::NoSigSolver)?;
        let decrypted = set.solve_sig(encrypted)?;
        let key = non_empty(req.signature_key.as_deref()).unwrap_or(DEFAULT_SIGNATURE_KEY);
        upsert(&mut pairs, key, decrypted);
        pairs.retain(|(k, _)| k != "s");
        modified = true;
    }

    if let Some(set) = solvers.as_ref().filter(|s| s.has_n_solver()) {
        let n = n_param.ok_or(CipherError::NParamMissing)?;
        let solved = set.solve_n(&n)?;
        upsert(&mut pairs, "n", solved);
        modified = true;
    }

    // Untouched URLs pass through byte-identical; rewriting would
    // re-encode query components the client never asked us to change.
    if modified {
        set_query(&mut stream_url, &pairs);
    }

    Ok(ResolveUrlResponse {
        resolved_url: stream_url.into(),
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

fn sig_capable(solvers: &Option<SolverSet>) -> Option<&SolverSet> {
    solvers.as_ref().filter(|s| s.has_sig_solver())
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn upsert(pairs: &mut Vec<(String, String)>, key: &str, value: String) {
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value,
        None => pairs.push((key.to_string(), value)),
    }
}

/// Serializes the pairs back onto the URL with minimal escaping, preserving
/// characters (like `!`) that form-urlencoding would mangle.
fn set_query(url: &mut Url, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    let query = pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, QUERY_COMPONENT),
                utf8_percent_encode(v, QUERY_COMPONENT)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(Some(&query));
}
