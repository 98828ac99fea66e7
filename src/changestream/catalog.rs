//! Stream definitions and stage interpolation
//!
//! A stage may reference request variables (the `avars` query parameter):
//!
//! - `{"$var": "name"}` or `{"$var": ["name", default]}` is replaced by the
//!   variable's value, or the default when unbound.
//! - A stage `{"$ifvar": [names, stage, else?]}` becomes `stage` when every
//!   named variable is bound, else the `else` stage, else it is dropped.
//!
//! Variable names may use dot notation to reach into nested documents.

use super::key::{ChangeStreamWorkerKey, JsonMode};
use super::{ChangeStreamDefinition, ChangeStreamError};
use arc_swap::ArcSwap;
use serde_json::{Map, Value};

const VAR: &str = "$var";
const IFVAR: &str = "$ifvar";

/// `/{db}/{coll}/_streams/{stream}` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPath {
    pub db: String,
    pub coll: String,
    pub stream: String,
}

pub fn parse_stream_path(path: &str) -> Option<StreamPath> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [db, coll, "_streams", stream] => Some(StreamPath {
            db: db.to_string(),
            coll: coll.to_string(),
            stream: stream.to_string(),
        }),
        _ => None,
    }
}

/// Everything needed to attach a session.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub key: ChangeStreamWorkerKey,
    pub db: String,
    pub coll: String,
    pub stages: Vec<Value>,
}

/// Stream definitions by collection. Collection updates replace or drop
/// definitions while sessions keep resolving against the current snapshot.
#[derive(Debug, Default)]
pub struct StreamCatalog {
    streams: ArcSwap<Vec<ChangeStreamDefinition>>,
}

impl StreamCatalog {
    pub fn new(streams: Vec<ChangeStreamDefinition>) -> Self {
        Self {
            streams: ArcSwap::from_pointee(streams),
        }
    }

    pub fn len(&self) -> usize {
        self.streams.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.load().is_empty()
    }

    pub fn find(&self, db: &str, coll: &str, stream: &str) -> Option<ChangeStreamDefinition> {
        self.streams
            .load()
            .iter()
            .find(|s| s.db == db && s.coll == coll && s.uri.trim_start_matches('/') == stream)
            .cloned()
    }

    /// Replace every definition of `db.coll` with `streams`.
    pub fn replace_collection(&self, db: &str, coll: &str, streams: Vec<ChangeStreamDefinition>) {
        self.streams.rcu(|current| {
            let mut next: Vec<ChangeStreamDefinition> = current
                .iter()
                .filter(|s| !(s.db == db && s.coll == coll))
                .cloned()
                .collect();
            next.extend(streams.iter().cloned());
            next
        });
    }

    /// Drop the definitions of `db`, or only those of `db.coll`. Returns
    /// how many were dropped.
    pub fn remove_matching(&self, db: &str, coll: Option<&str>) -> usize {
        let in_scope = |s: &ChangeStreamDefinition| s.db == db && coll.map_or(true, |c| s.coll == c);
        let previous = self.streams.rcu(|current| {
            current
                .iter()
                .filter(|s| !in_scope(s))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().filter(|s| in_scope(s)).count()
    }

    /// Resolve a stream request into its worker key and interpolated stages.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Result<ResolvedStream, ChangeStreamError> {
        let parsed = parse_stream_path(path)
            .ok_or_else(|| ChangeStreamError::StreamNotFound(path.to_string()))?;
        let definition = self
            .find(&parsed.db, &parsed.coll, &parsed.stream)
            .ok_or_else(|| ChangeStreamError::StreamNotFound(path.to_string()))?;

        let params = QueryParams::parse(query);
        let avars = parse_avars(params.avars.as_deref())?;
        let mode = match params.json_mode.as_deref() {
            Some(mode) => mode
                .parse::<JsonMode>()
                .map_err(ChangeStreamError::InvalidVariables)?,
            None => JsonMode::default(),
        };

        let stages = resolve_stages(&definition.stages, &avars)?;
        Ok(ResolvedStream {
            key: ChangeStreamWorkerKey::new(path, avars, mode),
            db: parsed.db,
            coll: parsed.coll,
            stages,
        })
    }
}

#[derive(Default)]
struct QueryParams {
    avars: Option<String>,
    json_mode: Option<String>,
}

impl QueryParams {
    fn parse(query: Option<&str>) -> Self {
        let mut params = Self::default();
        for (name, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match name.as_ref() {
                "avars" => params.avars = Some(value.into_owned()),
                "jsonMode" => params.json_mode = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// Parse the `avars` parameter. Variables must form a document and may
/// not carry operators, which would let a client rewrite the stages.
fn parse_avars(raw: Option<&str>) -> Result<Value, ChangeStreamError> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Map::new()));
    };
    let avars: Value = serde_json::from_str(raw)
        .map_err(|e| ChangeStreamError::InvalidVariables(format!("avars must be a JSON document: {e}")))?;
    if !avars.is_object() {
        return Err(ChangeStreamError::InvalidVariables(
            "avars must be a JSON document".to_string(),
        ));
    }
    reject_operators(&avars)?;
    Ok(avars)
}

fn reject_operators(value: &Value) -> Result<(), ChangeStreamError> {
    match value {
        Value::Object(map) => {
            if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
                return Err(ChangeStreamError::InvalidVariables(format!(
                    "aggregation variables cannot include operators, found {key}"
                )));
            }
            map.values().try_for_each(reject_operators)
        }
        Value::Array(items) => items.iter().try_for_each(reject_operators),
        _ => Ok(()),
    }
}

/// Apply `$ifvar` stage selection then `$var` substitution.
pub fn resolve_stages(stages: &[Value], avars: &Value) -> Result<Vec<Value>, ChangeStreamError> {
    let mut resolved = Vec::with_capacity(stages.len());
    for stage in stages {
        if let Some(stage) = select_stage(stage, avars)? {
            if let Value::Object(_) = stage {
                resolved.push(interpolate(stage, avars)?);
            }
        }
    }
    Ok(resolved)
}

fn select_stage(stage: &Value, avars: &Value) -> Result<Option<Value>, ChangeStreamError> {
    let Some(ifvar) = stage.get(IFVAR) else {
        return Ok(Some(stage.clone()));
    };

    let invalid = || ChangeStreamError::InvalidDefinition(format!("invalid optional stage: {stage}"));
    let args = ifvar.as_array().filter(|a| a.len() == 2 || a.len() == 3).ok_or_else(invalid)?;

    let names: Vec<&str> = match &args[0] {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().map(Value::as_str).collect::<Option<_>>().ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    if !args[1].is_object() || args.get(2).is_some_and(|e| !e.is_object()) {
        return Err(invalid());
    }

    if names.iter().all(|name| lookup(avars, name).is_some()) {
        Ok(Some(args[1].clone()))
    } else {
        Ok(args.get(2).cloned())
    }
}

fn interpolate(value: Value, avars: &Value) -> Result<Value, ChangeStreamError> {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key(VAR) => {
            let spec = &map[VAR];
            match spec {
                Value::String(name) => lookup(avars, name)
                    .cloned()
                    .ok_or_else(|| ChangeStreamError::VariableNotBound(name.clone())),
                Value::Array(args) if args.len() == 2 && args[0].is_string() => {
                    let name = args[0].as_str().unwrap_or_default();
                    Ok(lookup(avars, name).cloned().unwrap_or_else(|| args[1].clone()))
                }
                other => Err(ChangeStreamError::InvalidDefinition(format!(
                    "invalid {VAR} operator: {other}"
                ))),
            }
        }
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| interpolate(v, avars).map(|v| (k, v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        Value::Array(items) => items
            .into_iter()
            .map(|v| interpolate(v, avars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn lookup<'a>(avars: &'a Value, name: &str) -> Option<&'a Value> {
    name.split('.').try_fold(avars, |current, segment| current.get(segment))
}
