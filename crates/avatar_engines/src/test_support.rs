use axum::Router;

/// Serves `router` on an ephemeral loopback port and returns its base URL.
pub(crate) async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub listener must bind");
    let addr = listener.local_addr().expect("stub must have an address");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("stub server must run");
    });
    format!("http://{addr}")
}
