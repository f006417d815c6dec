//! API Module Tests
//!
//! Drives real loopback nodes over HTTP with `reqwest`.
//!
//! ## Test Scopes
//! - **Lifecycle**: Topic and context CRUD through the public endpoints, with the envelope
//!   and status codes clients rely on.
//! - **Cluster**: Any node answers any request; owners' responses are passed through
//!   unchanged, misrouted and failed forwards are reported instead of retried. A topic
//!   exists on every node or on none.

#[cfg(test)]
mod tests {
    use crate::api;
    use crate::cache::LruCache;
    use crate::config::ShardConfig;
    use crate::router::{Coordinator, FORWARDED_HEADER, Forwarder};
    use crate::sharding::ShardTable;
    use crate::storage::{Context, Storage};
    use reqwest::{Method, StatusCode};
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct Node {
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    impl Node {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }
    }

    /// Starts `size` nodes on loopback; indices listed in `down` get an address nobody
    /// listens on.
    async fn spawn_cluster(size: usize, down: &[usize]) -> (ShardTable, Vec<Node>) {
        let mut listeners = Vec::with_capacity(size);
        for _ in 0..size {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let shards: Vec<ShardConfig> = listeners
            .iter()
            .enumerate()
            .map(|(idx, listener)| ShardConfig {
                name: format!("shard-{}", idx),
                idx,
                address: listener.local_addr().unwrap().to_string(),
            })
            .collect();

        let mut nodes = Vec::new();
        for (idx, listener) in listeners.into_iter().enumerate() {
            if down.contains(&idx) {
                continue;
            }
            let table = ShardTable::from_shards(&shards, &format!("shard-{}", idx)).unwrap();
            let dir = tempfile::tempdir().unwrap();
            let storage = Arc::new(Storage::open(dir.path().join("vault.redb")).unwrap());
            let forwarder = Forwarder::new(idx, Duration::from_secs(2)).unwrap();
            let coordinator = Arc::new(Coordinator::new(
                table,
                storage.clone(),
                LruCache::new(1 << 20),
                forwarder,
            ));

            let addr = listener.local_addr().unwrap();
            let app = api::router(coordinator.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            nodes.push(Node {
                addr,
                coordinator,
                storage,
                _dir: dir,
            });
        }

        (ShardTable::from_shards(&shards, "shard-0").unwrap(), nodes)
    }

    async fn call(method: Method, url: String, body: Option<Value>) -> (StatusCode, Value) {
        let client = reqwest::Client::new();
        let mut request = client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    fn key_on(table: &ShardTable, shard: usize, prefix: &str) -> String {
        (0..)
            .map(|i| format!("{}-{}", prefix, i))
            .find(|key| table.index(key) == shard)
            .unwrap()
    }

    // ============================================================
    // LIFECYCLE (single node)
    // ============================================================

    #[tokio::test]
    async fn test_notes_scenario() {
        let (_table, nodes) = spawn_cluster(1, &[]).await;
        let node = &nodes[0];

        let (status, body) = call(
            Method::POST,
            node.url("/api/v1/topics"),
            Some(json!({ "name": "notes" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["name"], "notes");
        assert_eq!(body["data"]["context_count"], 0);

        let (status, body) = call(
            Method::POST,
            node.url("/api/v1/topics/notes/contexts"),
            Some(json!({
                "metadata": { "type": "doc" },
                "content": { "data": { "text": "buy milk" } }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["data"]["metadata"]["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());
        assert_eq!(body["data"]["metadata"]["topic"], "notes");
        assert_eq!(body["data"]["metadata"]["type"], "doc");
        assert_eq!(
            body["data"]["metadata"]["size"],
            r#"{"text":"buy milk"}"#.len()
        );

        let (status, body) = call(
            Method::GET,
            node.url(&format!("/api/v1/topics/notes/contexts/{}", id)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["content"]["data"], json!({ "text": "buy milk" }));
        assert_eq!(body["data"]["content"]["compressed"], false);

        let (_, body) = call(Method::GET, node.url("/api/v1/topics/notes"), None).await;
        assert_eq!(body["data"]["context_count"], 1);

        let (_, body) = call(Method::GET, node.url("/api/v1/topics/notes/contexts"), None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(Method::GET, node.url("/api/v1/topics"), None).await;
        assert_eq!(body["data"][0]["name"], "notes");

        let (status, body) = call(
            Method::DELETE,
            node.url(&format!("/api/v1/topics/notes/contexts/{}", id)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let (status, body) = call(
            Method::GET,
            node.url(&format!("/api/v1/topics/notes/contexts/{}", id)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains(&id));

        let (_, body) = call(Method::GET, node.url("/api/v1/topics/notes"), None).await;
        assert_eq!(body["data"]["context_count"], 0);
    }

    #[tokio::test]
    async fn test_delete_topic_endpoint() {
        let (_table, nodes) = spawn_cluster(1, &[]).await;
        let node = &nodes[0];

        call(
            Method::POST,
            node.url("/api/v1/topics"),
            Some(json!({ "name": "drafts" })),
        )
        .await;
        for id in ["a", "b"] {
            call(
                Method::POST,
                node.url("/api/v1/topics/drafts/contexts"),
                Some(json!({ "metadata": { "id": id }, "content": { "data": id } })),
            )
            .await;
        }

        let (status, body) = call(Method::DELETE, node.url("/api/v1/topics/drafts"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["data"],
            json!({ "name": "drafts", "removed_contexts": 2, "unreachable_shards": [] })
        );
        assert_eq!(node.coordinator.cache().count(), 0);

        let (status, _) = call(Method::GET, node.url("/api/v1/topics/drafts"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_client_errors() {
        let (_table, nodes) = spawn_cluster(1, &[]).await;
        let node = &nodes[0];

        let malformed = reqwest::Client::new()
            .post(node.url("/api/v1/topics"))
            .header("content-type", "application/json")
            .body("{ not json")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        let body: Value = malformed.json().await.unwrap();
        assert_eq!(body["success"], false);

        let (status, _) = call(
            Method::POST,
            node.url("/api/v1/topics"),
            Some(json!({ "name": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            Method::POST,
            node.url("/api/v1/topics/missing/contexts"),
            Some(json!({ "content": { "data": 1 } })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(Method::GET, node.url("/api/v1/topics/missing"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_and_purge_endpoints() {
        let (_table, nodes) = spawn_cluster(1, &[]).await;
        let node = &nodes[0];

        let (status, body) = call(Method::GET, node.url("/api/v1/stats"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["shard_index"], 0);
        assert_eq!(body["data"]["shard_count"], 1);
        assert_eq!(body["data"]["cache_capacity"], 1 << 20);

        // A single shard owns every id.
        let (status, body) = call(Method::POST, node.url("/api/v1/admin/purge"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed"], json!([]));
    }

    // ============================================================
    // CLUSTER
    // ============================================================

    #[tokio::test]
    async fn test_three_node_routing_returns_owner_response() {
        let (table, nodes) = spawn_cluster(3, &[]).await;
        let id = key_on(&table, 2, "ctx");
        let topic = "notes";

        // Created through node 0, lands on the topic's home shard.
        let (status, body) = call(
            Method::POST,
            nodes[0].url("/api/v1/topics"),
            Some(json!({ "name": topic })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], topic);
        let home = table.index(topic);
        assert!(nodes[home].storage.get_topic(topic).is_ok());

        let (status, _) = call(
            Method::POST,
            nodes[0].url(&format!("/api/v1/topics/{}/contexts", topic)),
            Some(json!({
                "metadata": { "id": id, "type": "code" },
                "content": { "data": { "lang": "rust" } }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = reqwest::Client::new()
            .get(nodes[0].url(&format!("/api/v1/topics/{}/contexts/{}", topic, id)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );
        let body: Value = response.json().await.unwrap();
        let served: Context = serde_json::from_value(body["data"].clone()).unwrap();

        // The owner's cache holds exactly what it answered with.
        assert_eq!(nodes[2].coordinator.cache().get(&id), Some(served));
        assert!(nodes[2].storage.get_context(topic, &id).is_ok());
        assert!(!nodes[0].coordinator.cache().contains(&id));
        assert!(nodes[0].storage.get_context(topic, &id).is_err());
    }

    #[tokio::test]
    async fn test_every_node_answers_topic_reads() {
        let (table, nodes) = spawn_cluster(3, &[]).await;
        let topic = key_on(&table, 1, "topic");

        call(
            Method::POST,
            nodes[2].url("/api/v1/topics"),
            Some(json!({ "name": topic })),
        )
        .await;

        for node in &nodes {
            let (status, body) =
                call(Method::GET, node.url(&format!("/api/v1/topics/{}", topic)), None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["name"], topic.as_str());
        }
        assert!(nodes[0].storage.get_topic(&topic).is_err());
        assert!(nodes[1].storage.get_topic(&topic).is_ok());
    }

    #[tokio::test]
    async fn test_store_without_id_stays_on_receiving_node() {
        let (table, nodes) = spawn_cluster(3, &[]).await;
        let topic = key_on(&table, 1, "topic");
        call(
            Method::POST,
            nodes[0].url("/api/v1/topics"),
            Some(json!({ "name": topic })),
        )
        .await;

        let (status, body) = call(
            Method::POST,
            nodes[0].url(&format!("/api/v1/topics/{}/contexts", topic)),
            Some(json!({ "content": { "data": "hello" } })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let id = body["data"]["metadata"]["id"].as_str().unwrap();
        assert_eq!(table.index(id), 0);
        assert_eq!(nodes[0].storage.get_topic(&topic).unwrap().context_count, 1);
        assert_eq!(nodes[1].storage.get_topic(&topic).unwrap().context_count, 0);
    }

    #[tokio::test]
    async fn test_store_into_uncreated_topic_fails_on_every_node() {
        let (table, nodes) = spawn_cluster(3, &[]).await;

        // Each node owns the id it is sent, so every rejection is its own.
        for (shard, node) in nodes.iter().enumerate() {
            let id = key_on(&table, shard, "ctx");
            let (status, body) = call(
                Method::POST,
                node.url("/api/v1/topics/ghost/contexts"),
                Some(json!({ "metadata": { "id": id }, "content": { "data": 1 } })),
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND, "shard {}", shard);
            assert_eq!(body["success"], false);
        }

        for node in &nodes {
            assert!(node.storage.list_topics().unwrap().is_empty());
            assert_eq!(node.coordinator.cache().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_delete_topic_removes_satellite_copies() {
        let (table, nodes) = spawn_cluster(3, &[]).await;
        let topic = key_on(&table, 1, "topic");
        call(
            Method::POST,
            nodes[0].url("/api/v1/topics"),
            Some(json!({ "name": topic })),
        )
        .await;

        for shard in 0..3 {
            let id = key_on(&table, shard, "ctx");
            let (status, _) = call(
                Method::POST,
                nodes[0].url(&format!("/api/v1/topics/{}/contexts", topic)),
                Some(json!({ "metadata": { "id": id }, "content": { "data": shard } })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(nodes[shard].coordinator.cache().contains(&id));
        }
        for node in &nodes {
            assert_eq!(node.storage.get_topic(&topic).unwrap().context_count, 1);
        }

        let (status, body) = call(
            Method::DELETE,
            nodes[2].url(&format!("/api/v1/topics/{}", topic)),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed_contexts"], 3);
        assert_eq!(body["data"]["unreachable_shards"], json!([]));
        for node in &nodes {
            assert!(node.storage.get_topic(&topic).is_err());
            assert_eq!(node.coordinator.cache().count(), 0);
        }

        let (status, _) = call(
            Method::GET,
            nodes[1].url(&format!("/api/v1/topics/{}", topic)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_topic_reports_unreachable_shards() {
        let (table, nodes) = spawn_cluster(3, &[2]).await;
        let topic = key_on(&table, 0, "topic");
        call(
            Method::POST,
            nodes[0].url("/api/v1/topics"),
            Some(json!({ "name": topic })),
        )
        .await;

        let (status, body) = call(
            Method::DELETE,
            nodes[0].url(&format!("/api/v1/topics/{}", topic)),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed_contexts"], 0);
        assert_eq!(body["data"]["unreachable_shards"], json!([2]));
    }

    #[tokio::test]
    async fn test_forwarded_request_is_not_forwarded_again() {
        let (table, nodes) = spawn_cluster(3, &[]).await;
        let id = key_on(&table, 2, "ctx");

        let response = reqwest::Client::new()
            .get(nodes[0].url(&format!("/api/v1/topics/notes/contexts/{}", id)))
            .header(FORWARDED_HEADER, "1")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_unreachable_owner_is_bad_gateway() {
        let (table, nodes) = spawn_cluster(2, &[1]).await;
        let id = key_on(&table, 1, "ctx");

        let (status, body) = call(
            Method::GET,
            nodes[0].url(&format!("/api/v1/topics/notes/contexts/{}", id)),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_owner_error_is_bad_gateway() {
        let (table, nodes) = spawn_cluster(3, &[]).await;
        let id = key_on(&table, 2, "ctx");

        // Node 2 answers 404; the forwarding node reports the failed hop.
        let (status, body) = call(
            Method::GET,
            nodes[0].url(&format!("/api/v1/topics/notes/contexts/{}", id)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("404"));

        let (status, _) = call(
            Method::GET,
            nodes[2].url(&format!("/api/v1/topics/notes/contexts/{}", id)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
