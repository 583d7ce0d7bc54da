//! The control plane over a real Unix socket, driven by the client.

use std::time::Duration;

use warden_cli::{ControlClient, bind_socket, router};
use warden_lsp::testing::diagnostic;
use warden_types::{Severity, WardenError};

use crate::common::project;

#[tokio::test]
async fn client_and_daemon_talk_over_the_socket() {
    let project = project(&[("app.fk", vec![diagnostic(2, Severity::Warning, "shadowed")])]).await;
    let socket = project.dir.path().join("run").join("ctl.sock");
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    // Left behind by a crashed daemon.
    std::fs::write(&socket, b"stale").unwrap();

    let listener = bind_socket(&socket).unwrap();
    let (state, shutdown) = project.control(100);
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
    });

    let client = ControlClient::new(&socket, Duration::from_secs(5));
    let health = client.health().await.unwrap();
    assert_eq!(&health.project_hash, project.service.project_hash());

    let file = project.path("app.fk");
    let result = client.diagnostics(Some(&file)).await.unwrap();
    assert_eq!(result.counts.warnings, 1);
    assert_eq!(result.diagnostics[0].line(), 2);
    assert_eq!(result.diagnostics[0].message(), "shadowed");

    let all = client.diagnostics(None).await.unwrap();
    assert_eq!(all.diagnostics.len(), 1);
    client.reset_dedup().await.unwrap();

    client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stopped")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn rate_limited_answers_surface_as_control_plane_errors() {
    let project = project(&[("app.fk", Vec::new())]).await;
    let socket = project.dir.path().join("ctl.sock");
    let listener = bind_socket(&socket).unwrap();
    let (state, shutdown) = project.control(1);
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
    });

    let client = ControlClient::new(&socket, Duration::from_secs(5));
    client.reset_dedup().await.unwrap();
    let err = client.reset_dedup().await.unwrap_err();
    match err {
        WardenError::ControlPlane(message) => assert!(message.contains("429"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
    server.abort();
}
