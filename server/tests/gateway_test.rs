mod common;

use common::*;
use ldap3::{Scope, SearchEntry};
use ldap_gateway::backends::database::{hash_password, DatabaseAuth, DatabaseDirectory};
use ldap_gateway::backends::ReloadSettings;
use ldap_gateway::build_engine;
use ldap_gateway::db::{DirectoryStore, MemoryStore, StoredCredential};
use ldap_gateway::registry::{BackendKind, BackendPlugin, Constructor, ProviderRegistry};
use ldap_gateway_core::{
    stable_id, AuthProvider, DirectoryProvider, GatewayError, GroupRecord, Metrics,
    ProviderError, UserRecord,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_reload() -> ReloadSettings {
    ReloadSettings {
        poll: Duration::from_millis(20),
        quiet: Duration::from_millis(50),
    }
}

fn metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().unwrap())
}

async fn search_uids(ldap: &mut ldap3::Ldap, filter: &str) -> Vec<String> {
    let (entries, _) = ldap
        .search(BASE_DN, Scope::Subtree, filter, vec!["uid"])
        .await
        .unwrap()
        .success()
        .unwrap();
    entries
        .into_iter()
        .map(SearchEntry::construct)
        .filter_map(|e| e.attrs.get("uid").and_then(|v| v.first().cloned()))
        .collect()
}

#[tokio::test]
async fn test_proxmox_bind_search_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let (user_cfg, shadow_cfg) = write_proxmox_files(dir.path());
    let user_cfg_str = user_cfg.to_string_lossy().into_owned();
    let shadow_cfg_str = shadow_cfg.to_string_lossy().into_owned();
    let settings = settings(&[
        ("AUTH_BACKEND", "proxmox"),
        ("DIRECTORY_BACKEND", "proxmox"),
        ("PROXMOX_USER_CFG", &user_cfg_str),
        ("PROXMOX_SHADOW_CFG", &shadow_cfg_str),
    ]);
    let metrics = metrics();
    let registry = ProviderRegistry::new(settings.clone())
        .with_metrics(metrics.clone())
        .with_reload(fast_reload());

    let mut engine = build_engine(&settings, &registry, metrics.clone()).await.unwrap();
    engine.start().await.unwrap();
    let mut ldap = connect(engine.local_addr().unwrap()).await;

    ldap.simple_bind(&user_dn("ann"), "secret")
        .await
        .unwrap()
        .success()
        .unwrap();
    let res = ldap.simple_bind(&user_dn("bob"), "wrong").await.unwrap();
    assert_eq!(res.rc, 49);

    let (entries, _) = ldap
        .search(BASE_DN, Scope::Subtree, "(uid=ann)", vec!["*"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 1);
    let ann = SearchEntry::construct(entries.into_iter().next().unwrap());
    assert_eq!(ann.attrs["uidNumber"], vec![stable_id("ann").to_string()]);
    assert_eq!(ann.attrs["mail"], vec!["ann@example.com".to_string()]);
    assert_eq!(ann.attrs["sn"], vec!["Example".to_string()]);

    let (groups, _) = ldap
        .search(BASE_DN, Scope::Subtree, "(objectClass=posixGroup)", vec!["cn", "memberUid"])
        .await
        .unwrap()
        .success()
        .unwrap();
    let mut names: Vec<String> = groups
        .into_iter()
        .map(SearchEntry::construct)
        .map(|g| g.attrs["cn"][0].clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["dev".to_string(), "ops".to_string()]);

    // new user appears once the file settles
    std::fs::write(
        &user_cfg,
        format!("{}user:carol@pve:1:0:Carol:Jones::::\n", USER_CFG),
    )
    .unwrap();
    let mut found = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if search_uids(&mut ldap, "(uid=carol)").await == vec!["carol".to_string()] {
            found = true;
            break;
        }
    }
    assert!(found, "carol never appeared after reload");

    // a malformed rewrite keeps the previous snapshot
    std::fs::write(&user_cfg, "group::ann@pve::\n").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(search_uids(&mut ldap, "(uid=carol)").await, vec!["carol".to_string()]);
    let failures = metrics
        .directory_reloads_total
        .with_label_values(&["proxmox_user_cfg", "failure"])
        .get();
    assert!(failures >= 1.0);

    ldap.unbind().await.unwrap();
    engine.stop().await;
}

fn memory_constructor(store: Arc<MemoryStore>) -> Constructor {
    let auth_store = store.clone();
    Constructor::new()
        .with_auth(move |_ctx| {
            let store = auth_store.clone() as Arc<dyn DirectoryStore>;
            Box::pin(async move {
                Ok::<_, ProviderError>(Arc::new(DatabaseAuth::new(store)) as Arc<dyn AuthProvider>)
            })
        })
        .with_directory(move |ctx| {
            let store = store.clone() as Arc<dyn DirectoryStore>;
            Box::pin(async move {
                if ctx.options.get("read_only").and_then(|v| v.as_bool()) != Some(true) {
                    return Err(ProviderError::Backend("expected read_only option".into()));
                }
                Ok::<_, ProviderError>(
                    Arc::new(DatabaseDirectory::new(store)) as Arc<dyn DirectoryProvider>
                )
            })
        })
}

#[tokio::test]
async fn test_database_backend_through_plugin() {
    let store = Arc::new(MemoryStore::new());
    let mut ann = UserRecord::new("ann", 20001, 20001);
    ann.display_name = Some("Ann Example".to_string());
    store
        .insert_user(
            ann,
            Some(StoredCredential {
                password: hash_password("secret", "pepper"),
                salt: Some("pepper".to_string()),
            }),
        )
        .await;
    store
        .insert_user(
            UserRecord::new("bob", 20002, 20002),
            Some(StoredCredential {
                password: "plain".to_string(),
                salt: None,
            }),
        )
        .await;
    store
        .insert_group(GroupRecord::new("ops", 6000).with_members(["ann"]))
        .await;
    store
        .insert_group(GroupRecord::new("dev", 6001).with_members(["bob"]))
        .await;

    let settings = settings(&[("AUTH_BACKEND", "staff"), ("DIRECTORY_BACKEND", "staff")]);
    let mut registry = ProviderRegistry::new(settings.clone());
    registry.register_constructor("memory", memory_constructor(store));
    registry
        .register_plugin(BackendPlugin::new("staff", BackendKind::Auth, "memory"))
        .unwrap();
    registry
        .register_plugin(
            BackendPlugin::new("staff", BackendKind::Directory, "memory")
                .with_options(json!({ "read_only": true })),
        )
        .unwrap();

    let mut engine = build_engine(&settings, &registry, metrics()).await.unwrap();
    engine.start().await.unwrap();
    let mut ldap = connect(engine.local_addr().unwrap()).await;

    let res = ldap.simple_bind(&user_dn("ann"), "wrong").await.unwrap();
    assert_eq!(res.rc, 49);
    ldap.simple_bind(&user_dn("bob"), "plain")
        .await
        .unwrap()
        .success()
        .unwrap();
    ldap.simple_bind(&user_dn("ann"), "secret")
        .await
        .unwrap()
        .success()
        .unwrap();

    let (groups, _) = ldap
        .search(
            BASE_DN,
            Scope::Subtree,
            "(&(objectClass=posixGroup)(memberUid=ann))",
            vec!["cn"],
        )
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(SearchEntry::construct(groups.into_iter().next().unwrap()).attrs["cn"], vec!["ops".to_string()]);

    ldap.unbind().await.unwrap();
    engine.stop().await;
}

async fn bind_with_push_answer(answer: serde_json::Value) -> u32 {
    let push = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer))
        .expect(1)
        .mount(&push)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (user_cfg, shadow_cfg) = write_proxmox_files(dir.path());
    let user_cfg_str = user_cfg.to_string_lossy().into_owned();
    let shadow_cfg_str = shadow_cfg.to_string_lossy().into_owned();
    let url = format!("{}/notify", push.uri());
    let settings = settings(&[
        ("AUTH_BACKEND", "proxmox"),
        ("DIRECTORY_BACKEND", "proxmox"),
        ("PROXMOX_USER_CFG", &user_cfg_str),
        ("PROXMOX_SHADOW_CFG", &shadow_cfg_str),
        ("ENABLE_NOTIFICATION", "true"),
        ("NOTIFICATION_URL", &url),
        ("NOTIFICATION_TIMEOUT_SECS", "5"),
    ]);
    let registry = ProviderRegistry::new(settings.clone());
    let mut engine = build_engine(&settings, &registry, metrics()).await.unwrap();
    engine.start().await.unwrap();
    let mut ldap = connect(engine.local_addr().unwrap()).await;

    let res = ldap.simple_bind(&user_dn("ann"), "secret").await.unwrap();
    engine.stop().await;
    res.rc
}

#[tokio::test]
async fn test_step_up_rejection_fails_bind() {
    assert_eq!(bind_with_push_answer(json!({"action": "reject"})).await, 49);
}

#[tokio::test]
async fn test_step_up_approval_allows_bind() {
    assert_eq!(bind_with_push_answer(json!({"action": "approve"})).await, 0);
}

#[tokio::test]
async fn test_unknown_push_action_is_operations_error() {
    assert_eq!(bind_with_push_answer(json!({"action": "MAYBE"})).await, 1);
}

#[tokio::test]
async fn test_unknown_backend_is_reported() {
    let settings = settings(&[("AUTH_BACKEND", "nope"), ("DIRECTORY_BACKEND", "proxmox")]);
    let registry = ProviderRegistry::new(settings.clone());
    match build_engine(&settings, &registry, metrics()).await {
        Err(GatewayError::UnknownBackend(msg)) => assert!(msg.contains("nope")),
        Err(other) => panic!("expected unknown backend, got {:?}", other),
        Ok(_) => panic!("expected unknown backend"),
    }
}
