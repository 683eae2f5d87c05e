// Status API binary: runs the monitor in-process and exposes health, status,
// metrics and the resync command over HTTP.
mod application;
mod handlers;
mod state;


use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Bootstrap failures exit non-zero after printing the cause.
    if let Err(err) = application::run().await {
        eprintln!("[api] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}
