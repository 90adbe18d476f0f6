//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::detect::replay::export_limits;
use crate::detect::StrategyConfig;
use crate::model::{AttributeKey, AttributeUpdate};
use crate::watch::{AttributeMeta, Entity, LifecycleEvent};

const DEFAULT_ALERT_LIMIT: usize = 50;
const MAX_ALERT_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/watched", get(list_watched))
        .route("/limits", post(limits))
        .route("/alerts", get(list_alerts))
        .route("/events", post(submit_event))
        .route("/entities/{id}", put(upsert_entity).delete(delete_entity))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "watched": state.registry.len(),
            "shards": state.ingest.shard_count(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_watched(State(state): State<AppState>) -> Json<Value> {
    let watched: Vec<Value> = state
        .registry
        .keys()
        .into_iter()
        .filter_map(|key| state.registry.get(&key))
        .map(|entry| {
            let strategies: Vec<&str> = entry.configs().iter().map(|c| c.kind.as_str()).collect();
            json!({
                "entity_id": entry.key().entity_id,
                "attribute_name": entry.key().attribute_name,
                "strategies": strategies,
            })
        })
        .collect();
    let total = watched.len();
    Json(json!({ "data": watched, "meta": { "total": total } }))
}

#[derive(Debug, Deserialize)]
struct LimitsRequest {
    entity_id: String,
    attribute_name: String,
    strategy: StrategyConfig,
}

async fn limits(State(state): State<AppState>, Json(req): Json<LimitsRequest>) -> ApiResult<Json<Value>> {
    let key = AttributeKey::new(req.entity_id, req.attribute_name);
    let store = state.store.clone();
    let export = tokio::task::spawn_blocking(move || export_limits(&store, &key, &req.strategy))
        .await?
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({ "data": export })))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

async fn list_alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT).min(MAX_ALERT_LIMIT);
    let alerts = state.alerts.clone();
    let recent = tokio::task::spawn_blocking(move || alerts.list_recent(limit))
        .await?
        .map_err(ApiError::from_anyhow)?;
    let total = recent.len();
    Ok(Json(json!({ "data": recent, "meta": { "total": total } })))
}

async fn submit_event(
    State(state): State<AppState>,
    Json(update): Json<AttributeUpdate>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let store = state.store.clone();
    let stored_update = update.clone();
    let stored = tokio::task::spawn_blocking(move || store.record_update(&stored_update))
        .await?
        .map_err(ApiError::from_anyhow)?;
    let watched = state.registry.contains(&update.key());

    state
        .ingest
        .submit(update)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "stored": stored, "watched": watched } })),
    ))
}

#[derive(Debug, Deserialize)]
struct EntityBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    attributes: Vec<AttributeMeta>,
}

async fn upsert_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EntityBody>,
) -> ApiResult<Json<Value>> {
    let entity = Entity {
        id: id.clone(),
        name: body.name,
        attributes: body.attributes,
    };
    let store = state.store.clone();
    let event = tokio::task::spawn_blocking(move || store.upsert_entity(&entity))
        .await?
        .map_err(ApiError::from_anyhow)?;
    state.registry.apply(&event);

    let kind = match event {
        LifecycleEvent::Created(_) => "created",
        _ => "updated",
    };
    let watched: Vec<String> = state
        .registry
        .keys()
        .into_iter()
        .filter(|k| k.entity_id == id)
        .map(|k| k.attribute_name)
        .collect();
    Ok(Json(json!({ "data": { "id": id, "event": kind, "watched": watched } })))
}

async fn delete_entity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let store = state.store.clone();
    let lookup = id.clone();
    let event = tokio::task::spawn_blocking(move || store.delete_entity(&lookup))
        .await?
        .map_err(ApiError::from_anyhow)?
        .ok_or_else(|| ApiError::NotFound(format!("entity {}", id)))?;
    state.registry.apply(&event);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use tempfile::TempDir;
    use tower::ServiceExt; // for `oneshot`

    use super::*;
    use crate::api::router;
    use crate::ingest::{Engine, IngestPipeline};
    use crate::model::Classification;
    use crate::ports::HistoryStore;
    use crate::storage::alerts::AlertManager;
    use crate::storage::SqliteStore;
    use crate::watch::WatchRegistry;

    struct Harness {
        _dir: TempDir,
        state: AppState,
        _pipeline: IngestPipeline,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("api.db").to_str().unwrap()).unwrap();
        let alerts = AlertManager::new(store.pool().clone());
        let registry = Arc::new(WatchRegistry::new());
        let engine = Arc::new(Engine::new(
            registry.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(alerts.clone()),
        ));
        let pipeline = IngestPipeline::spawn(engine, 2, 16);
        let state = AppState {
            store,
            alerts,
            registry,
            ingest: pipeline.handle(),
        };
        Harness {
            _dir: dir,
            state,
            _pipeline: pipeline,
        }
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = router(state.clone()).oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_000_000).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn boiler() -> Value {
        json!({
            "name": "Boiler",
            "attributes": [
                {
                    "name": "temp",
                    "store_datapoints": true,
                    "anomaly_detection": [{
                        "kind": "range",
                        "name": "Boiler temperature",
                        "timespan": "1h",
                        "minimum_points": 3,
                        "alert_enabled": true,
                        "alert_severity": "high"
                    }]
                },
                { "name": "label", "store_datapoints": false }
            ]
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let h = harness();
        let (status, json) = call(&h.state, Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["shards"], 2);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let h = harness();
        let (status, _) = call(&h.state, Method::GET, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_entity_lifecycle_updates_watch_list() {
        let h = harness();
        let (status, json) = call(&h.state, Method::PUT, "/api/v1/entities/boiler", Some(boiler())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["event"], "created");
        assert_eq!(json["data"]["watched"], json!(["temp"]));

        let (_, json) = call(&h.state, Method::GET, "/api/v1/watched", None).await;
        assert_eq!(json["meta"]["total"], 1);
        assert_eq!(json["data"][0]["strategies"], json!(["range"]));

        let (status, _) = call(&h.state, Method::DELETE, "/api/v1/entities/boiler", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(h.state.registry.is_empty());

        let (status, json) = call(&h.state, Method::DELETE, "/api/v1/entities/boiler", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_event_is_classified_and_alerts() {
        let h = harness();
        call(&h.state, Method::PUT, "/api/v1/entities/boiler", Some(boiler())).await;
        let key = AttributeKey::new("boiler", "temp");
        for (t, v) in [(1_000, 60.0), (2_000, 62.0), (3_000, 61.0)] {
            h.state.store.record_datapoint(&key, t, v).unwrap();
        }

        let event = json!({"entity_id": "boiler", "attribute_name": "temp", "value": 95.0, "timestamp": 4_000});
        let (status, json) = call(&h.state, Method::POST, "/api/v1/events", Some(event)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["data"]["stored"], true);
        assert_eq!(json["data"]["watched"], true);

        // Same key, same shard: this waits for the submitted event.
        let next = AttributeUpdate {
            entity_id: "boiler".to_string(),
            attribute_name: "temp".to_string(),
            value: Some(json!(61.5)),
            timestamp: 5_000,
        };
        assert_eq!(h.state.ingest.evaluate(next).await.unwrap(), Some(Classification::Valid));

        let recorded = h.state.store.query_classifications(&key, 0, 10_000).unwrap();
        assert_eq!(recorded[0], (4_000, Classification::RangeOutlier));

        let (_, json) = call(&h.state, Method::GET, "/api/v1/alerts?limit=5", None).await;
        assert_eq!(json["meta"]["total"], 1);
        assert_eq!(json["data"][0]["title"], "Boiler temperature");
        assert_eq!(json["data"][0]["severity"], "high");
    }

    #[tokio::test]
    async fn test_limits_export() {
        let h = harness();
        let key = AttributeKey::new("boiler", "temp");
        for (t, v) in [(1_000, 60.0), (2_000, 62.0), (3_000, 61.0)] {
            h.state.store.record_datapoint(&key, t, v).unwrap();
        }
        let body = json!({
            "entity_id": "boiler",
            "attribute_name": "temp",
            "strategy": {"kind": "range", "timespan": "1h", "minimum_points": 3}
        });
        let (status, json) = call(&h.state, Method::POST, "/api/v1/limits", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "raw_only");
        assert_eq!(json["data"]["points"].as_array().unwrap().len(), 3);

        let body = json!({
            "entity_id": "boiler",
            "attribute_name": "temp",
            "strategy": {"kind": "interval", "timespan": "1h", "minimum_points": 3}
        });
        let (status, json) = call(&h.state, Method::POST, "/api/v1/limits", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "BAD_REQUEST");
    }
}
