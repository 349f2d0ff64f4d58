use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let port = std::env::var("MOCK_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("mock server for netreq listening on http://{addr}");
    println!("routes: /text/latin1-meta /text/header-charset /xml /echo /headers /bytes/{{n}}");
    println!("        /redirect /slow?ms= /cookies /status/{{code}} /stats");
    mock_server::run(listener).await
}
