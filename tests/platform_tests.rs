//! End-to-end tests of the platform through the real router, SQLite store
//! and progress bus, with fakes standing in for GitHub, git, the image
//! builder and the cluster.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::json;

use common::*;
use treenq::platform::kube::{ClusterApplier, ClusterSettings, ManifestInput, synthesize};
use treenq::platform::models::{AppDeployment, DeploymentStatus, Level};
use treenq::platform::pipeline::PipelineConfig;
use treenq::platform::store::Store;

const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

// =============================================================================
// HTTP surface
// =============================================================================

mod http_surface {
    use super::*;

    #[tokio::test]
    async fn test_healthz() {
        let app = TestApp::new();
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_preflight_answers_no_content() {
        let app = TestApp::new();
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/deploy")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization,content-type")
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn test_operations_require_bearer() {
        let app = TestApp::new();
        let req = Request::builder()
            .method("POST")
            .uri("/info")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["code"], "UNAUTHORIZED");

        let (status, body) = app.rpc("info", "not-a-jwt", json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_info_and_profile() {
        let app = TestApp::new();
        let (token, user, _) = app.seed().await;

        let (status, body) = app.rpc("info", &token, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "1.2.3");

        let (status, body) = app.rpc("getProfile", &token, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["userInfo"]["id"], user.id.as_str());
        assert_eq!(body["workspace"]["name"], "alice");
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_decoding_error() {
        let app = TestApp::new();
        let (token, _, _) = app.seed().await;
        let req = Request::builder()
            .method("POST")
            .uri("/deploy")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "FAILED_DECODING");
    }

    #[tokio::test]
    async fn test_auth_redirect_sets_state_cookie() {
        let app = TestApp::new();
        let req = Request::builder().uri("/auth").body(Body::empty()).unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://github.test/login/oauth/authorize?state="));
        let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("authstate="));
        assert!(cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn test_auth_callback_without_cookie() {
        let app = TestApp::new();
        let req = Request::builder()
            .uri("/authCallback?code=good&state=abc")
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "COOKIE_IS_EMPTY");
    }

    #[tokio::test]
    async fn test_full_login_round_trip() {
        let app = TestApp::new();
        let resp = app
            .send(Request::builder().uri("/auth").body(Body::empty()).unwrap())
            .await;
        let cookie = resp.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let state = cookie.trim_start_matches("authstate=").to_string();

        let req = Request::builder()
            .uri(format!("/authCallback?code=good&state={}", state))
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookies: Vec<_> = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("authToken=")));
        let token = body_json(resp).await["accessToken"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, body) = app.rpc("getProfile", &token, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["userInfo"]["email"], "alice@example.com");

        let req = Request::builder()
            .method("POST")
            .uri("/logout")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cleared = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cleared.starts_with("authToken=;"));
        assert!(cleared.contains("Max-Age=0"));
    }
}

// =============================================================================
// Webhooks
// =============================================================================

mod webhooks {
    use super::*;

    #[tokio::test]
    async fn test_first_install_links_repositories() {
        let app = TestApp::new();
        let (status, _) = app
            .webhook(json!({
                "action": "created",
                "installation": {"id": 42},
                "sender": {"login": "alice"},
                "repositories": [{"id": 7, "full_name": "alice/app", "private": false}]
            }))
            .await;
        assert_eq!(status, StatusCode::OK);

        let installation = app.store.get_installation(42).await.unwrap();
        assert_eq!(installation.owner, "alice");
        let repo = app.store.get_repo_by_vcs_id(7).await.unwrap();
        assert_eq!(repo.full_name, "alice/app");
        assert!(!repo.connected);
        assert!(app.store.get_deployments(&repo.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forged_webhook_is_rejected() {
        let app = TestApp::new();
        let body = json!({
            "action": "created",
            "installation": {"id": 42},
            "sender": {"login": "mallory"},
            "repositories": [{"id": 7, "full_name": "alice/app"}]
        })
        .to_string();

        for signature in [None, Some("sha256=00"), Some("not-a-signature")] {
            let mut req = Request::builder()
                .method("POST")
                .uri("/githubWebhook")
                .header("content-type", "application/json");
            if let Some(sig) = signature {
                req = req.header("x-hub-signature-256", sig);
            }
            let resp = app.send(req.body(Body::from(body.clone())).unwrap()).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(resp).await["code"], "INVALID_SIGNATURE");
        }
        assert!(app.store.get_installation(42).await.is_err());
        assert_eq!(app.git.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repositories_added_and_removed() {
        let app = TestApp::new();
        app.seed().await;

        app.webhook(json!({
            "action": "added",
            "installation": {"id": 42},
            "sender": {"login": "alice"},
            "repositories_added": [{"id": 8, "full_name": "alice/api"}]
        }))
        .await;
        assert!(app.store.get_repo_by_vcs_id(8).await.is_ok());

        app.webhook(json!({
            "action": "removed",
            "installation": {"id": 42},
            "repositories_removed": [{"id": 8, "full_name": "alice/api"}]
        }))
        .await;
        assert!(app.store.get_repo_by_vcs_id(8).await.is_err());
        assert!(app.store.get_repo_by_vcs_id(7).await.is_ok());
    }

    #[tokio::test]
    async fn test_installation_deleted_removes_namespaces() {
        let app = TestApp::new();
        let (_, _, repo) = app.seed().await;

        let (status, _) = app
            .webhook(json!({
                "action": "deleted",
                "installation": {"id": 42},
                "repositories": [{"id": 7, "full_name": "alice/app"}]
            }))
            .await;
        assert_eq!(status, StatusCode::OK);

        let removed = app.cluster.removed_namespaces.lock().unwrap().clone();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with(&repo.id));
        assert!(app.store.get_installation(42).await.is_err());
        assert!(app.store.get_repo_by_vcs_id(7).await.is_err());
    }

    #[tokio::test]
    async fn test_push_main_deploys() {
        let app = TestApp::new();
        let (_, _, repo) = app.seed_connected().await;

        let (status, body) = app.webhook(push_payload("main", SHA_A)).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["deploymentIds"][0].as_str().unwrap().to_string();

        let messages = app.wait_final(&id).await;
        let last = messages.last().unwrap();
        assert!(last.is_final);
        assert_ne!(last.level, Level::Error);
        assert_eq!(messages.iter().filter(|m| m.is_final).count(), 1);
        app.wait_idle().await;

        let deployment = app.store.get_deployment(&id).await.unwrap();
        assert_eq!(deployment.repo_id, repo.id);
        assert_eq!(deployment.status, DeploymentStatus::Done);
        assert_eq!(deployment.sha, SHA_A);
        assert_eq!(deployment.space.key, repo.id);

        for kind in ["Namespace", "Deployment", "Service", "Ingress"] {
            assert_eq!(app.cluster.count(kind), 1, "{kind}");
        }
        assert_eq!(app.builder.build_count(), 1);
    }

    #[tokio::test]
    async fn test_push_with_broken_manifest_fails() {
        let app = TestApp::new();
        let (_, _, _) = app.seed_connected().await;
        app.git.set_manifest(Some("{\"service\": "));

        let (_, body) = app.webhook(push_payload("main", SHA_A)).await;
        let id = body["deploymentIds"][0].as_str().unwrap().to_string();

        let messages = app.wait_final(&id).await;
        let last = messages.last().unwrap();
        assert_eq!(last.level, Level::Error);
        assert_eq!(last.error_code.as_deref(), Some("TQ_NOT_FOUND"));
        assert!(last.is_final);
        app.wait_idle().await;

        let deployment = app.store.get_deployment(&id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error.is_some());
        assert_eq!(app.cluster.applies.load(Ordering::SeqCst), 0);
        assert!(app.cluster.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_push_deploys_once() {
        let app = TestApp::new();
        let (_, _, repo) = app.seed_connected().await;

        let (_, body) = app.webhook(push_payload("main", SHA_A)).await;
        let id = body["deploymentIds"][0].as_str().unwrap().to_string();
        app.wait_final(&id).await;
        app.wait_idle().await;

        let (status, body) = app.webhook(push_payload("main", SHA_A)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deploymentIds"], json!([]));

        let done = app
            .store
            .get_deployments(&repo.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Done && d.sha == SHA_A)
            .count();
        assert_eq!(done, 1);
        assert_eq!(app.builder.build_count(), 1);
    }

    #[tokio::test]
    async fn test_push_to_other_branches_is_ignored() {
        let app = TestApp::new();
        app.seed_connected().await;

        let (_, body) = app.webhook(push_payload("feature", SHA_A)).await;
        assert_eq!(body["deploymentIds"], json!([]));

        let tag = json!({
            "ref": "refs/tags/v1",
            "after": SHA_A,
            "installation": {"id": 42},
            "repository": {"id": 7, "full_name": "alice/app"}
        });
        let (_, body) = app.webhook(tag).await;
        assert_eq!(body["deploymentIds"], json!([]));
        assert_eq!(app.git.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_to_disconnected_repo_is_ignored() {
        let app = TestApp::new();
        app.seed().await;
        let (_, body) = app.webhook(push_payload("main", SHA_A)).await;
        assert_eq!(body["deploymentIds"], json!([]));
        assert_eq!(app.git.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_branch_deletion_push_is_ignored() {
        let app = TestApp::new();
        app.seed_connected().await;
        let (status, body) = app.webhook(push_payload("main", &"0".repeat(40))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deploymentIds"], json!([]));
        assert_eq!(app.git.clones.load(Ordering::SeqCst), 0);
    }
}

// =============================================================================
// Deployments
// =============================================================================

mod deployments {
    use super::*;

    async fn deploy_sha(app: &TestApp, token: &str, repo_id: &str, sha: &str) -> String {
        let (status, body) = app
            .rpc("deploy", token, json!({"repoId": repo_id, "sha": sha}))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let id = body["deployment"]["id"].as_str().unwrap().to_string();
        app.wait_final(&id).await;
        app.wait_idle().await;
        id
    }

    #[tokio::test]
    async fn test_deploy_requires_connected_repo() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed().await;
        let (status, body) = app.rpc("deploy", &token, json!({"repoId": repo.id})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "REPO_IS_NOT_CONNECTED");
    }

    #[tokio::test]
    async fn test_deploy_rejects_several_refs() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        let (status, body) = app
            .rpc(
                "deploy",
                &token,
                json!({"repoId": repo.id, "branch": "main", "sha": SHA_A}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "ONLY_BRANCH_OR_SHA_OR_TAG_ALLOWED");
    }

    #[tokio::test]
    async fn test_deploy_unknown_repo() {
        let app = TestApp::new();
        let (token, _, _) = app.seed_connected().await;
        let (_, body) = app.rpc("deploy", &token, json!({"repoId": "nope"})).await;
        assert_eq!(body["code"], "REPO_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_deploy_defaults_to_connected_branch() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        let (_, body) = app.rpc("deploy", &token, json!({"repoId": repo.id})).await;
        assert_eq!(body["deployment"]["branch"], "main");
        let id = body["deployment"]["id"].as_str().unwrap().to_string();
        app.wait_final(&id).await;
        app.wait_idle().await;

        let (_, body) = app
            .rpc("getDeployment", &token, json!({"deploymentId": id}))
            .await;
        assert_eq!(body["deployment"]["status"], "done");
    }

    #[tokio::test]
    async fn test_rollback_reuses_image() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;

        let d1 = deploy_sha(&app, &token, &repo.id, SHA_A).await;
        let d2 = deploy_sha(&app, &token, &repo.id, SHA_B).await;
        assert_eq!(app.builder.build_count(), 2);

        let (status, body) = app
            .rpc("rollbackDeployment", &token, json!({"deploymentId": d1}))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let d3 = body["deployment"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["deployment"]["rolledBackFromId"], d1.as_str());
        app.wait_final(&d3).await;
        app.wait_idle().await;

        let source = app.store.get_deployment(&d1).await.unwrap();
        let rollback = app.store.get_deployment(&d3).await.unwrap();
        assert_eq!(rollback.status, DeploymentStatus::Done);
        assert_eq!(rollback.build_tag, source.build_tag);
        assert_eq!(rollback.sha, SHA_A);
        assert_eq!(app.builder.build_count(), 2);

        let later = app.store.get_deployment(&d2).await.unwrap();
        assert_eq!(later.status, DeploymentStatus::RolledBack);

        let (_, body) = app
            .rpc("getDeploymentHistory", &token, json!({"repoId": repo.id}))
            .await;
        assert_eq!(body["history"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rollback_requires_finished_source() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        app.git.set_manifest(None);
        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_A}))
            .await;
        let failed = body["deployment"]["id"].as_str().unwrap().to_string();
        app.wait_final(&failed).await;
        app.wait_idle().await;

        let (status, body) = app
            .rpc("rollbackDeployment", &token, json!({"deploymentId": failed}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_redeploy_with_present_image_skips_build() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        let d1 = deploy_sha(&app, &token, &repo.id, SHA_A).await;

        let (status, body) = app
            .rpc(
                "deploy",
                &token,
                json!({"repoId": repo.id, "fromDeploymentId": d1}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let d2 = body["deployment"]["id"].as_str().unwrap().to_string();
        app.wait_final(&d2).await;
        app.wait_idle().await;

        assert_eq!(app.builder.build_count(), 1);
        assert_eq!(
            app.store.get_deployment(&d2).await.unwrap().status,
            DeploymentStatus::Done
        );
    }

    #[tokio::test]
    async fn test_redeploy_rebuilds_missing_image() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        let d1 = deploy_sha(&app, &token, &repo.id, SHA_A).await;
        app.builder.published.lock().unwrap().clear();

        let (_, body) = app
            .rpc(
                "deploy",
                &token,
                json!({"repoId": repo.id, "fromDeploymentId": d1}),
            )
            .await;
        let d2 = body["deployment"]["id"].as_str().unwrap().to_string();
        app.wait_final(&d2).await;
        app.wait_idle().await;

        assert_eq!(app.builder.build_count(), 2);
        let redeployed = app.store.get_deployment(&d2).await.unwrap();
        assert_eq!(redeployed.status, DeploymentStatus::Done);
        assert_eq!(redeployed.sha, SHA_A);
    }

    #[tokio::test]
    async fn test_new_deployment_supersedes_running_one() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        app.builder.hold.store(true, Ordering::SeqCst);

        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_A}))
            .await;
        let first = body["deployment"]["id"].as_str().unwrap().to_string();
        tokio::time::timeout(Duration::from_secs(10), async {
            while app.builder.build_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        app.builder.hold.store(false, Ordering::SeqCst);
        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_B}))
            .await;
        let second = body["deployment"]["id"].as_str().unwrap().to_string();

        let messages = app.wait_final(&first).await;
        let last = messages.last().unwrap();
        assert_eq!(last.error_code.as_deref(), Some("SUPERSEDED"));

        app.wait_final(&second).await;
        app.wait_idle().await;
        let first = app.store.get_deployment(&first).await.unwrap();
        assert_eq!(first.status, DeploymentStatus::Failed);
        assert_eq!(
            app.store.get_deployment(&second).await.unwrap().status,
            DeploymentStatus::Done
        );
    }

    #[tokio::test]
    async fn test_deploy_timeout_fails_the_run() {
        let app = TestApp::with_config(PipelineConfig {
            deploy_timeout: Duration::from_millis(300),
            supersede: true,
            ..Default::default()
        });
        let (token, _, repo) = app.seed_connected().await;
        app.builder.hold.store(true, Ordering::SeqCst);

        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_A}))
            .await;
        let id = body["deployment"]["id"].as_str().unwrap().to_string();
        let messages = app.wait_final(&id).await;
        assert_eq!(
            messages.last().unwrap().error_code.as_deref(),
            Some("DEPLOY_TIMEOUT")
        );
        app.wait_idle().await;
        assert_eq!(
            app.store.get_deployment(&id).await.unwrap().status,
            DeploymentStatus::Failed
        );
        assert_eq!(app.git.clones.load(Ordering::SeqCst), 1);
        assert!(app.leftover_clones().is_empty());
    }

    #[tokio::test]
    async fn test_build_paths_outside_repository_are_rejected() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        app.git.set_manifest(Some(
            r#"{"service": {"name": "web", "httpPort": 8080,
                "dockerContext": "/root", "dockerfilePath": "../../etc/Dockerfile"}}"#,
        ));

        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_A}))
            .await;
        let id = body["deployment"]["id"].as_str().unwrap().to_string();
        let messages = app.wait_final(&id).await;
        assert_eq!(
            messages.last().unwrap().error_code.as_deref(),
            Some("INVALID_SPACE")
        );
        app.wait_idle().await;
        assert_eq!(app.builder.build_count(), 0);
        assert!(app.leftover_clones().is_empty());
    }

    #[tokio::test]
    async fn test_missing_build_secret_fails_the_run() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        app.git.set_manifest(Some(
            r#"{"service": {"name": "web", "httpPort": 8080, "buildSecrets": ["NPM_TOKEN"]}}"#,
        ));

        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_A}))
            .await;
        let id = body["deployment"]["id"].as_str().unwrap().to_string();
        let messages = app.wait_final(&id).await;
        assert_eq!(
            messages.last().unwrap().error_code.as_deref(),
            Some("SECRET_DOESNT_EXIST")
        );
        assert_eq!(app.builder.build_count(), 0);
    }

    #[tokio::test]
    async fn test_build_secrets_reach_the_builder() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        app.git.set_manifest(Some(
            r#"{"service": {"name": "web", "httpPort": 8080, "buildSecrets": ["NPM_TOKEN"]}}"#,
        ));
        let (status, _) = app
            .rpc(
                "setSecret",
                &token,
                json!({"repoId": repo.id, "key": "NPM_TOKEN", "value": "npm_123"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        deploy_sha(&app, &token, &repo.id, SHA_A).await;
        assert_eq!(
            app.builder.last_secrets.lock().unwrap().get("NPM_TOKEN"),
            Some(&"npm_123".to_string())
        );
    }

    #[tokio::test]
    async fn test_build_progress_stream() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        let id = deploy_sha(&app, &token, &repo.id, SHA_A).await;

        let req = Request::builder()
            .uri(format!("/getBuildProgress?deploymentId={}", id))
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<serde_json::Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| serde_json::from_str(d.trim_start()).unwrap())
            .collect();
        assert_eq!(events.first().unwrap()["payload"], "queued");
        assert_eq!(events.last().unwrap()["final"], true);
        assert_eq!(events.iter().filter(|e| e["final"] == true).count(), 1);
    }

    #[tokio::test]
    async fn test_build_progress_of_finished_deployment_without_history() {
        let app = TestApp::new();
        let (token, user, repo) = app.seed_connected().await;
        let mut row = app
            .store
            .save_deployment(AppDeployment::new(&repo.id, &user.display_name))
            .await
            .unwrap();
        row.status = DeploymentStatus::Done;
        let row = app.store.update_deployment(&row).await.unwrap();

        let req = Request::builder()
            .uri(format!("/getBuildProgress?deploymentId={}", row.id))
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = tokio::time::timeout(Duration::from_secs(5), resp.into_body().collect())
            .await
            .expect("stream should close after the final event")
            .unwrap()
            .to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<serde_json::Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| serde_json::from_str(d.trim_start()).unwrap())
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["final"], true);
        assert_eq!(events[0]["payload"], "deployment done");
        assert!(app.progress.is_empty());
    }

    #[tokio::test]
    async fn test_workload_stats_after_deploy() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;

        let (_, body) = app
            .rpc("getWorkloadStats", &token, json!({"repoId": repo.id}))
            .await;
        assert_eq!(body["code"], "NO_PODS_RUNNING");

        deploy_sha(&app, &token, &repo.id, SHA_A).await;
        let (status, body) = app
            .rpc("getWorkloadStats", &token, json!({"repoId": repo.id}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workloadStats"]["overallStatus"], "healthy");
        assert_eq!(body["workloadStats"]["replicas"]["running"], 1);
    }

    #[tokio::test]
    async fn test_deployments_are_hidden_from_other_users() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        let id = deploy_sha(&app, &token, &repo.id, SHA_A).await;

        let bob = app
            .store
            .get_or_create_user(treenq::platform::models::UserInfo {
                email: "bob@example.com".into(),
                display_name: "bob".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let bob_token = app.token_for(&bob.id);

        let (_, body) = app
            .rpc("getDeployment", &bob_token, json!({"deploymentId": id}))
            .await;
        assert_eq!(body["code"], "DEPLOYMENT_NOT_FOUND");
        let (_, body) = app
            .rpc("getDeployments", &bob_token, json!({"repoId": repo.id}))
            .await;
        assert_eq!(body["code"], "REPO_NOT_FOUND");
    }
}

// =============================================================================
// Repositories
// =============================================================================

mod repositories {
    use super::*;

    #[tokio::test]
    async fn test_get_repos_and_branches() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed().await;

        let (_, body) = app.rpc("getRepos", &token, json!({})).await;
        assert_eq!(body["installation"], true);
        assert_eq!(body["repos"][0]["fullName"], "alice/app");
        assert_eq!(body["repos"][0]["connected"], false);

        let (_, body) = app
            .rpc("getBranches", &token, json!({"repoId": repo.id}))
            .await;
        assert_eq!(body["branches"], json!(["main", "dev"]));
    }

    #[tokio::test]
    async fn test_connect_repo_branch() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed().await;
        let (status, body) = app
            .rpc(
                "connectRepoBranch",
                &token,
                json!({"repoId": repo.id, "branch": "dev"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repo"]["connected"], true);
        assert_eq!(body["repo"]["connectedBranch"], "dev");
    }

    #[tokio::test]
    async fn test_sync_github_app() {
        let app = TestApp::new();
        let (token, user, _) = app.seed().await;

        let (status, body) = app.rpc("syncGithubApp", &token, json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        app.store
            .save_token_pair(&user.id, "gho_access", "ghr_refresh")
            .await
            .unwrap();
        let (_, body) = app.rpc("syncGithubApp", &token, json!({})).await;
        assert_eq!(body["code"], "NO_INSTALLATIONS_FOUND");

        app.vcs.installations.lock().unwrap().push(99);
        app.vcs.repos.lock().unwrap().insert(
            99,
            vec![treenq::platform::models::InstalledRepository {
                id: 11,
                full_name: "alice/worker".into(),
                private: true,
                default_branch: Some("main".into()),
            }],
        );
        let (status, body) = app.rpc("syncGithubApp", &token, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<_> = body["repos"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["fullName"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"alice/worker".to_string()));
        assert!(names.contains(&"alice/app".to_string()));
    }
}

// =============================================================================
// Secrets
// =============================================================================

mod secrets {
    use super::*;

    #[tokio::test]
    async fn test_secret_lifecycle() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed().await;
        let namespace = format!("alice-{}", repo.id);

        let (status, _) = app
            .rpc(
                "setSecret",
                &token,
                json!({"repoId": repo.id, "key": "K", "value": "V"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.cluster.secret_keys(&namespace, &repo.id), vec!["K"]);

        let (_, body) = app.rpc("getSecrets", &token, json!({"repoId": repo.id})).await;
        assert_eq!(body["keys"], json!(["K"]));

        let (_, body) = app
            .rpc("revealSecrets", &token, json!({"repoId": repo.id, "keys": ["K"]}))
            .await;
        assert_eq!(body["values"]["K"], "V");

        let (status, _) = app
            .rpc("removeSecret", &token, json!({"repoId": repo.id, "key": "K"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.cluster.secret_keys(&namespace, &repo.id).is_empty());

        let (_, body) = app.rpc("getSecrets", &token, json!({"repoId": repo.id})).await;
        assert_eq!(body["keys"], json!([]));

        let (status, body) = app
            .rpc("revealSecrets", &token, json!({"repoId": repo.id, "keys": ["K"]}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "SECRET_DOESNT_EXIST");
        assert_eq!(body["meta"]["key"], "K");
    }

    #[tokio::test]
    async fn test_invalid_secret_key() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed().await;
        for key in ["1KEY", "", "with space", "_lead"] {
            let (status, body) = app
                .rpc(
                    "setSecret",
                    &token,
                    json!({"repoId": repo.id, "key": key, "value": "v"}),
                )
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{key}");
            assert_eq!(body["code"], "INVALID_SECRET_KEY");
        }
        assert!(app.cluster.secrets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secret_keys_are_injected_into_the_workload() {
        let app = TestApp::new();
        let (token, _, repo) = app.seed_connected().await;
        app.rpc(
            "setSecret",
            &token,
            json!({"repoId": repo.id, "key": "DATABASE_URL", "value": "postgres://"}),
        )
        .await;

        let (_, body) = app
            .rpc("deploy", &token, json!({"repoId": repo.id, "sha": SHA_A}))
            .await;
        let id = body["deployment"]["id"].as_str().unwrap().to_string();
        app.wait_final(&id).await;
        app.wait_idle().await;

        let objects = app.cluster.objects.lock().unwrap();
        let deployment = objects
            .iter()
            .find(|((kind, _, _), _)| kind == "Deployment")
            .map(|(_, body)| body.clone())
            .unwrap();
        assert!(deployment.contains("DATABASE_URL"));
        assert!(!deployment.contains("postgres://"));
    }
}

// =============================================================================
// Cluster apply
// =============================================================================

#[tokio::test]
async fn test_applying_a_manifest_twice_converges() {
    let cluster = FakeCluster::default();
    let mut space = valid_space();
    space.key = "repo1".into();
    let image = treenq::platform::models::Image {
        registry: REGISTRY.into(),
        repository: "repo1".into(),
        tag: "abc".into(),
    };
    let manifest = synthesize(
        &ManifestInput {
            deployment_id: "d1",
            repo_id: "repo1",
            workspace_name: "alice",
            space: &space,
            image: &image,
            secret_keys: &["K".to_string()],
        },
        &ClusterSettings::default(),
    )
    .unwrap();

    let first = cluster.apply(&manifest).await.unwrap();
    let state = cluster.objects.lock().unwrap().clone();
    let second = cluster.apply(&manifest).await.unwrap();

    assert!(first.created > 0);
    assert_eq!(second.created, 0);
    assert_eq!(second.updated + second.kept, first.created);
    assert_eq!(*cluster.objects.lock().unwrap(), state);
}
