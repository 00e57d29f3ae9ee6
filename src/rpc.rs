use crate::db::KeyValueStore;
use crate::error::Error;
use crate::service::{CrossReferencesRequest, DecorationsRequest, QueryContext, XRefService};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: &'static str,
    message: String,
}

struct MethodDoc {
    name: &'static str,
    summary: &'static str,
    key_params: &'static [&'static str],
}

const METHOD_DOCS: &[MethodDoc] = &[
    MethodDoc {
        name: "decorations",
        summary: "Text, references and target definitions for one file.",
        key_params: &[
            "location.ticket",
            "location.span",
            "source_text",
            "references",
            "target_definitions",
            "filter",
        ],
    },
    MethodDoc {
        name: "cross_references",
        summary: "Definitions, declarations, references and related nodes of symbols.",
        key_params: &[
            "ticket",
            "reference_kind",
            "definition_kind",
            "declaration_kind",
            "related_node_kind",
            "filter",
            "page_size",
        ],
    },
    MethodDoc {
        name: "stats",
        summary: "Row counts and content hashes of the serving tables.",
        key_params: &[],
    },
    MethodDoc {
        name: "list_methods",
        summary: "This list.",
        key_params: &[],
    },
];

const METHOD_ALIASES: &[(&str, &str)] = &[
    ("xrefs", "cross_references"),
    ("decor", "decorations"),
    ("help", "list_methods"),
];

fn method_list() -> Value {
    let methods: Vec<Value> = METHOD_DOCS
        .iter()
        .map(|doc| {
            let aliases: Vec<&str> = METHOD_ALIASES
                .iter()
                .filter(|(_, target)| *target == doc.name)
                .map(|(alias, _)| *alias)
                .collect();
            json!({
                "name": doc.name,
                "summary": doc.summary,
                "key_params": doc.key_params,
                "aliases": aliases,
            })
        })
        .collect();
    json!({ "methods": methods })
}

fn resolve_alias(method: &str) -> &str {
    METHOD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == method)
        .map(|(_, target)| *target)
        .unwrap_or(method)
}

fn parse_params<T: DeserializeOwned + Default>(params: Value) -> crate::error::Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|err| Error::InvalidRequest(format!("bad params: {err}")))
}

/// Dispatch one method call against `service`.
pub fn handle_method<S: KeyValueStore>(
    service: &XRefService<S>,
    ctx: &QueryContext,
    method: &str,
    params: Value,
) -> crate::error::Result<Value> {
    match resolve_alias(method) {
        "decorations" => {
            let req: DecorationsRequest = parse_params(params)?;
            Ok(serde_json::to_value(service.decorations(ctx, &req)?)?)
        }
        "cross_references" => {
            let req: CrossReferencesRequest = parse_params(params)?;
            Ok(serde_json::to_value(service.cross_references(ctx, &req)?)?)
        }
        "stats" => Ok(json!({
            "format": format!("{:?}", service.format()).to_ascii_lowercase(),
            "tables": service.stats()?,
        })),
        "list_methods" => Ok(method_list()),
        other => Err(Error::InvalidRequest(format!("unknown method {other:?}"))),
    }
}

fn handle_request<S: KeyValueStore>(service: &XRefService<S>, req: RpcRequest) -> RpcResponse {
    tracing::debug!(method = %req.method, "rpc request");
    let ctx = QueryContext::new();
    match handle_method(service, &ctx, &req.method, req.params) {
        Ok(value) => RpcResponse {
            id: req.id,
            result: Some(value),
            error: None,
        },
        Err(err) => {
            if !err.is_not_found() {
                tracing::warn!(method = %req.method, "request failed: {err}");
            }
            error_response(req.id, err.code(), err.to_string())
        }
    }
}

fn error_response(id: Value, code: &'static str, message: String) -> RpcResponse {
    RpcResponse {
        id,
        result: None,
        error: Some(RpcError { code, message }),
    }
}

/// Answer JSONL requests from `input` until it ends. Returns the number of
/// responses written.
pub fn serve_lines<S, R, W>(service: &XRefService<S>, input: R, mut output: W) -> Result<usize>
where
    S: KeyValueStore,
    R: BufRead,
    W: Write,
{
    let mut answered = 0;
    for line in input.lines() {
        let line = match line {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("stdin error: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => handle_request(service, request),
            Err(err) => error_response(Value::Null, "invalid_request", format!("invalid request: {err}")),
        };

        writeln!(output, "{}", serde_json::to_string(&response)?)?;
        output.flush()?;
        answered += 1;
    }
    Ok(answered)
}

/// Run the JSONL RPC server over stdin/stdout.
pub fn serve<S: KeyValueStore>(service: &XRefService<S>) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let answered = serve_lines(service, stdin.lock(), stdout.lock())?;
    tracing::info!(answered, "rpc input closed");
    Ok(())
}

/// Run a single request and return the serialized response line.
pub fn call<S: KeyValueStore>(
    service: &XRefService<S>,
    method: String,
    params_raw: &str,
    id_raw: &str,
) -> Result<String> {
    let params: Value = serde_json::from_str(params_raw).with_context(|| "parse params JSON")?;
    let id = parse_value(id_raw);
    let response = handle_request(service, RpcRequest { id, method, params });
    Ok(serde_json::to_string(&response)?)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
