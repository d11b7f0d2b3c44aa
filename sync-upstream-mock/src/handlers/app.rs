use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use sync_common::metrics;

use super::collection::{self, Collection, CollectionState, Faults};
use super::sink::{self, Received};

/// Server-owned state of the mock: both upstream collections and the sink inbox.
#[derive(Clone)]
pub struct Upstream {
    pub customers: Collection,
    pub products: Collection,
    pub received: Received,
    pub faults: Faults,
}

impl Upstream {
    pub fn empty(faults: Faults) -> Self {
        Self {
            customers: Collection::new("customers"),
            products: Collection::new("products"),
            received: Received::default(),
            faults,
        }
    }
}

/// A few records of each kind, sharing ids so that the consumer has something to merge.
pub fn seeded(faults: Faults) -> Upstream {
    Upstream {
        customers: Collection::with_records(
            "customers",
            vec![
                json!({"id": "1", "name": "Ada Lovelace", "email": "ada@example.com"}),
                json!({"id": "2", "name": "Alan Turing", "email": "alan@example.com",
                       "additional": {"tier": "gold"}}),
            ],
        ),
        products: Collection::with_records(
            "products",
            vec![
                json!({"id": "1", "name": "Keyboard", "stock": 12}),
                json!({
                    "id": "3",
                    "name": "Monitor",
                    "stock": 0,
                    "additional": {"backorder": true}
                }),
            ],
        ),
        received: Received::default(),
        faults,
    }
}

pub fn app(upstream: Upstream, metrics: Option<PrometheusHandle>) -> Router {
    let collection_routes = |path: &str, collection: Collection| {
        Router::new()
            .route(path, routing::get(collection::list).post(collection::create))
            .with_state(CollectionState {
                collection,
                faults: upstream.faults.clone(),
            })
    };

    let routes = Router::new()
        .merge(collection_routes("/customers", upstream.customers.clone()))
        .merge(collection_routes("/products", upstream.products.clone()))
        .route(
            "/data",
            routing::post(sink::post)
                .get(sink::list)
                .with_state(upstream.received.clone()),
        )
        .layer(axum::middleware::from_fn(metrics::track_metrics));

    routes.merge(metrics::app("sync-upstream-mock", metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use serde_json::Value;
    use tower::ServiceExt; // for `oneshot`

    async fn call(
        app: Router,
        method: http::Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, body)
    }

    #[tokio::test]
    async fn index() {
        let response = app(Upstream::empty(Faults::default()), None)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"sync-upstream-mock");
    }

    #[tokio::test]
    async fn created_records_are_listed() {
        let upstream = seeded(Faults::default());

        let (status, created) = call(
            app(upstream.clone(), None),
            http::Method::POST,
            "/products",
            Some(json!({"name": "Mouse", "stock": 40, "additional": {"color": "black"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], json!("4"));

        let (status, listed) =
            call(app(upstream, None), http::Method::GET, "/products", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 3);
        assert_eq!(listed[2]["additional"], json!({"color": "black"}));
    }

    #[tokio::test]
    async fn non_object_records_are_rejected() {
        let (status, body) = call(
            app(Upstream::empty(Faults::default()), None),
            http::Method::POST,
            "/customers",
            Some(json!(["not", "a", "record"])),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("record must be a JSON object"));
    }

    #[tokio::test]
    async fn injected_faults_fail_reads() {
        let upstream = Upstream::empty(Faults::every(2));

        let (first, _) =
            call(app(upstream.clone(), None), http::Method::GET, "/customers", None).await;
        let (second, _) = call(app(upstream, None), http::Method::GET, "/products", None).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sink_keeps_received_documents() {
        let upstream = Upstream::empty(Faults::default());
        let document = json!({"key": "1", "customer": {"id": "1"}, "partial": true});

        let (status, _) = call(
            app(upstream.clone(), None),
            http::Method::POST,
            "/data",
            Some(document.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, received) =
            call(app(upstream.clone(), None), http::Method::GET, "/data", None).await;
        assert_eq!(received, json!([document]));
        assert_eq!(upstream.received.documents().len(), 1);
    }
}
