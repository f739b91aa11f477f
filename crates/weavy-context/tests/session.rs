mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use weavy_context::{
    BoxError, ConnectionState, Deadline, DestroyError, HttpError, MemoryStorage, NetworkState,
    QueryKey, ServerState, Storage, TokenError, UrlTokenFactory, WeavyContext, WeavyError,
};

use common::{CountingFactory, isolated_options, mock_context, spawn_environment, wait_until};

#[tokio::test]
async fn concurrent_get_token_calls_share_one_factory_call() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory(factory.returning(&["wyu_shared"], Duration::from_millis(50))),
    )
    .unwrap();

    let tokens = join_all((0..10).map(|_| context.get_token(false))).await;
    for token in tokens {
        assert_eq!(token.unwrap(), "wyu_shared");
    }
    assert_eq!(factory.calls(), 1);

    // cached afterwards
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_shared");
    assert_eq!(factory.calls(), 1);

    context.destroy().await;
}

#[tokio::test]
async fn get_token_waits_for_the_url() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options().with_token_factory(factory.returning(&["wyu_late"], Duration::ZERO)),
    )
    .unwrap();

    let pending = tokio::spawn({
        let context = context.clone();
        async move { context.get_token(false).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());
    assert_eq!(factory.calls(), 0);

    context.set_url(env.url()).unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), "wyu_late");

    context.destroy().await;
}

#[tokio::test]
async fn malformed_tokens_are_rejected() {
    let env = spawn_environment("0.1.0").await;

    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory_retry_delay(Duration::from_millis(10))
            .with_token_factory(factory.returning(&["not-a-token"], Duration::ZERO)),
    )
    .unwrap();
    let error = context.get_token(false).await.unwrap_err();
    assert!(matches!(error, TokenError::Invalid));
    // retried once with a refresh before giving up
    assert_eq!(factory.refreshes(), vec![false, true]);
    context.destroy().await;

    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory_retry_delay(Duration::from_millis(10))
            .with_token_factory(factory.returning(&["wys_secret"], Duration::ZERO)),
    )
    .unwrap();
    let error = context.get_token(false).await.unwrap_err();
    assert!(matches!(error, TokenError::ApiKey));
    assert!(error.to_string().contains("API key"));
    context.destroy().await;
}

#[tokio::test]
async fn refreshed_token_replaces_invalid_one() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory_retry_delay(Duration::from_millis(10))
            .with_token_factory(factory.returning(&["garbage", "wyu_good"], Duration::ZERO)),
    )
    .unwrap();

    assert_eq!(context.get_token(false).await.unwrap(), "wyu_good");
    assert_eq!(factory.refreshes(), vec![false, true]);
    context.when_token_is_valid().await.unwrap();
    context.when_session_ready().await.unwrap();

    context.destroy().await;
}

#[tokio::test]
async fn token_url_installs_a_default_factory() {
    let env = spawn_environment("0.1.0").await;
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_url(env.join("/token")),
    )
    .unwrap();

    assert!(context.has_token_factory());
    assert_eq!(context.token_url(), Some(env.join("/token")));
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_from_url");
    assert_eq!(context.get_token(true).await.unwrap(), "wyu_refreshed");

    context.destroy().await;
}

#[tokio::test]
async fn token_url_without_access_token_fails() {
    let env = spawn_environment("0.1.0").await;

    let factory = UrlTokenFactory::new(env.join("/token-empty"));
    let error = factory.fetch(false).await.unwrap_err();
    assert!(matches!(error, TokenError::MissingAccessToken));

    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_url(env.join("/token-empty")),
    )
    .unwrap();
    let error = context.get_token(false).await.unwrap_err();
    assert!(matches!(error, TokenError::Factory(_)));
    assert!(error.to_string().contains("access_token"));

    context.destroy().await;
}

#[tokio::test]
async fn token_url_does_not_replace_an_existing_factory() {
    let env = spawn_environment("0.1.0").await;
    let (context, factory, _hub) = mock_context(env.url().as_str(), &["wyu_own"]);

    context.set_token_url(env.join("/token")).unwrap();
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_own");
    assert_eq!(factory.calls(), 1);

    context.destroy().await;
}

#[tokio::test]
async fn replacing_the_factory_drops_the_cached_token() {
    let env = spawn_environment("0.1.0").await;
    let (context, _factory, _hub) = mock_context(env.url().as_str(), &["wyu_first"]);
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_first");

    context
        .set_token_factory(|_refresh: bool| async { Ok::<_, BoxError>("wyu_second".to_string()) })
        .unwrap();
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_second");

    context.destroy().await;
}

#[tokio::test]
async fn slow_factory_times_out() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory_timeout(Duration::from_millis(50))
            .with_token_factory(factory.returning(&["wyu_slow"], Duration::from_secs(5))),
    )
    .unwrap();

    let error = context.get_token(false).await.unwrap_err();
    assert!(matches!(error, TokenError::Timeout(_)));

    context.destroy().await;
}

#[tokio::test]
async fn dropped_caller_does_not_stall_the_shared_fetch() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory_timeout(Duration::from_millis(300))
            .with_token_factory(factory.returning(&["wyu_slow"], Duration::from_millis(100))),
    )
    .unwrap();

    // the caller gives up long before the factory answers
    let first = tokio::time::timeout(Duration::from_millis(10), context.get_token(false)).await;
    assert!(first.is_err());
    wait_until("factory call", || factory.calls() == 1).await;

    // well past the factory timeout, counted from the first call
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_slow");
    assert_eq!(factory.calls(), 1);

    context.destroy().await;
}

#[tokio::test]
async fn replacing_the_factory_refetches_stale_queries() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_stale_time(Duration::ZERO)
            .with_token_factory(factory.returning(&["wyu_first"], Duration::ZERO)),
    )
    .unwrap();
    let client = context.query_client();
    wait_until("mounted", || client.is_mounted()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher: weavy_context::QueryFn = Arc::new({
        let calls = calls.clone();
        move || -> n0_future::boxed::BoxFuture<Result<serde_json::Value, BoxError>> {
            let calls = calls.clone();
            Box::pin(async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) })
        }
    });
    client
        .fetch_query(QueryKey::from(["apps"]), fetcher)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    context
        .set_token_factory(|_refresh: bool| async { Ok::<_, BoxError>("wyu_second".to_string()) })
        .unwrap();
    wait_until("refetch", || calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(context.get_token(false).await.unwrap(), "wyu_second");

    context.destroy().await;
}

#[tokio::test]
async fn repeated_invalid_tokens_leave_the_session_unready() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory_retry_delay(Duration::from_millis(10))
            .with_token_factory_timeout(Deadline::Never)
            .with_token_factory(factory.returning(&["garbage"], Duration::ZERO)),
    )
    .unwrap();

    assert!(matches!(
        context.get_token(false).await,
        Err(TokenError::Invalid)
    ));
    assert_eq!(factory.calls(), 2);

    context.set_token_factory_retry_delay(Deadline::Never).unwrap();
    let pending = tokio::spawn({
        let context = context.clone();
        async move { context.get_token(false).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());
    assert_eq!(factory.calls(), 2);

    // a new factory makes the session ready again
    context
        .set_token_factory(|_refresh: bool| async { Ok::<_, BoxError>("wyu_good".to_string()) })
        .unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), "wyu_good");

    context.destroy().await;
}

#[tokio::test]
async fn connectivity_change_aborts_token_fetch() {
    let env = spawn_environment("0.1.0").await;
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(env.url())
            .with_token_factory(factory.returning(&["wyu_slow"], Duration::from_secs(5))),
    )
    .unwrap();

    let pending = tokio::spawn({
        let context = context.clone();
        async move { context.get_token(false).await }
    });
    wait_until("factory call", || factory.calls() == 1).await;
    context.signals().set_online(false);

    let error = pending.await.unwrap().unwrap_err();
    assert!(matches!(error, TokenError::NetworkChanged));

    context.destroy().await;
}

#[tokio::test]
async fn destroy_is_final() {
    let env = spawn_environment("0.1.0").await;
    let (context, _factory, _hub) = mock_context(env.url().as_str(), &["wyu_test"]);
    context.get_token(false).await.unwrap();

    context.destroy().await;
    context.destroy().await;
    assert!(context.is_destroyed());

    assert!(matches!(
        context.get_token(false).await,
        Err(TokenError::Destroyed(DestroyError))
    ));
    assert!(matches!(
        context.get("/api/echo").await,
        Err(HttpError::Destroyed(DestroyError))
    ));
    assert_eq!(
        context
            .subscribe(None, "x", Arc::new(|_: serde_json::Value| {}))
            .await,
        Err(DestroyError)
    );
    assert!(matches!(
        context.set_url(env.url()),
        Err(WeavyError::Destroyed(DestroyError))
    ));
    assert_eq!(context.set_stale_time(Duration::ZERO), Err(DestroyError));
    assert_eq!(context.when_realtime_started().await, Err(DestroyError));
    assert!(context.is_destroyed());
}

#[tokio::test]
async fn destroy_releases_pending_waiters() {
    let factory = CountingFactory::default();
    let context = WeavyContext::new(
        isolated_options().with_token_factory(factory.returning(&["wyu_never"], Duration::ZERO)),
    )
    .unwrap();

    let token = tokio::spawn({
        let context = context.clone();
        async move { context.get_token(false).await }
    });
    let ready = tokio::spawn({
        let context = context.clone();
        async move { context.when_session_ready().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    context.destroy().await;
    assert!(matches!(
        token.await.unwrap(),
        Err(TokenError::Destroyed(DestroyError))
    ));
    assert_eq!(ready.await.unwrap(), Err(DestroyError));
    assert_eq!(factory.calls(), 0);
}

#[tokio::test]
async fn network_state_follows_its_inputs() {
    // no token factory, so nothing in the background touches the server state
    let context = WeavyContext::new(isolated_options()).unwrap();

    context.set_connection_state(ConnectionState::Connected);
    context.set_server_state(ServerState::Ok);
    assert_eq!(context.network().state, NetworkState::Online);

    context.set_connection_state(ConnectionState::Disconnected);
    context.set_server_state(ServerState::Unreachable);
    assert_eq!(context.network().state, NetworkState::Unreachable);

    context.set_connection_state(ConnectionState::Connected);
    context.signals().set_online(false);
    wait_until("offline", || context.network().state == NetworkState::Offline).await;
    context.set_server_state(ServerState::Ok);
    assert_eq!(context.network().state, NetworkState::Offline);

    context.signals().set_online(true);
    wait_until("online", || context.network().state == NetworkState::Online).await;

    context.destroy().await;
}

#[tokio::test]
async fn network_listeners_see_each_change_once() {
    let context = WeavyContext::new(isolated_options()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let id = context.add_network_listener({
        let seen = seen.clone();
        move |status| seen.lock().unwrap().push(status)
    });

    context.set_server_state(ServerState::Unreachable);
    context.set_server_state(ServerState::Unreachable);
    context.set_network_state_is_pending(true);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].state, NetworkState::Unreachable);
        assert!(!seen[0].is_pending);
        assert!(seen[1].is_pending);
    }

    assert!(context.remove_network_listener(id));
    context.set_server_state(ServerState::Ok);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(context.network().state, NetworkState::Online);

    context.destroy().await;
}

#[tokio::test]
async fn query_cache_survives_a_new_context() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let key = QueryKey::from(["apps", "a1"]);

    let first = WeavyContext::new(
        isolated_options()
            .with_storage(storage.clone())
            .with_cache_namespace("persist-test"),
    )
    .unwrap();
    first
        .query_client()
        .set_query_data(key.clone(), json!({ "name": "chat" }));
    first.query_client().persist().unwrap();
    assert!(storage.get_item("weavy-persist-test-query-cache").unwrap().is_some());

    let second = WeavyContext::new(
        isolated_options()
            .with_storage(storage.clone())
            .with_cache_namespace("persist-test"),
    )
    .unwrap();
    assert_eq!(
        second.query_client().get_query_data(&key),
        Some(json!({ "name": "chat" }))
    );

    // teardown removes the persisted state
    second.destroy().await;
    assert!(storage.get_item("weavy-persist-test-query-cache").unwrap().is_none());
    first.destroy().await;
}

#[tokio::test]
async fn query_client_is_mounted_while_the_host_is_attached() {
    let context = WeavyContext::new(isolated_options()).unwrap();
    let client = context.query_client();
    wait_until("mounted", || client.is_mounted()).await;

    context.signals().set_host_attached(false);
    wait_until("unmounted", || !client.is_mounted()).await;
    context.signals().set_host_attached(true);
    wait_until("remounted", || client.is_mounted()).await;

    context.destroy().await;
    assert!(!client.is_mounted());
}

#[tokio::test]
async fn coming_back_online_refetches_stale_queries() {
    let context = WeavyContext::new(isolated_options().with_stale_time(Duration::ZERO)).unwrap();
    let client = context.query_client();
    wait_until("mounted", || client.is_mounted()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher: weavy_context::QueryFn = Arc::new({
        let calls = calls.clone();
        move || -> n0_future::boxed::BoxFuture<Result<serde_json::Value, BoxError>> {
            let calls = calls.clone();
            Box::pin(async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) })
        }
    });
    client
        .fetch_query(QueryKey::from(["feed"]), fetcher)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    context.signals().set_online(false);
    context.signals().set_online(true);
    wait_until("refetch", || calls.load(Ordering::SeqCst) >= 2).await;

    context.destroy().await;
}

#[tokio::test]
async fn contexts_get_distinct_ids() {
    let a = WeavyContext::new(isolated_options()).unwrap();
    let b = WeavyContext::new(isolated_options()).unwrap();
    assert_ne!(a.id(), b.id());
    assert!(a.composite_id().starts_with("weavy-context-"));
    assert_eq!(a.version(), weavy_context::VERSION);
    a.destroy().await;
    b.destroy().await;
}

#[test]
fn context_requires_a_runtime() {
    let error = WeavyContext::new(isolated_options()).unwrap_err();
    assert!(matches!(error, WeavyError::Config(_)));
}
