use std::net::SocketAddr;

use http::StatusCode;
use turnpike::{handlers, Config, Context, Engine, HandlerFuture};

fn index(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move { ctx.string(StatusCode::OK, "Hello, World!") })
}

fn hello(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        let name = ctx.path_value("name").to_string();
        ctx.string(StatusCode::OK, format!("Hello, {}!", name))
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let mut engine = Engine::new(Config {
        redirect_trailing_slash: true,
        ..Config::default()
    });
    engine.get("/", handlers![index]);
    engine.get("/hello/:name", handlers![hello]);

    let addr: SocketAddr = ([127, 0, 0, 1], 3000).into();
    hyper::Server::bind(&addr).serve(engine.into_service()).await?;
    Ok(())
}
