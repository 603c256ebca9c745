//! Dub a short video with default options.
//!
//! Usage: cargo run --example basic -- https://youtu.be/VIDEO_ID dubbed.mp4

#[tokio::main]
async fn main() -> redub::Result<()> {
    let url = std::env::args()
        .nth(1)
        .expect("usage: basic <url> [output.mp4]");
    let output = std::env::args().nth(2).unwrap_or_else(|| "dubbed.mp4".into());

    let outcome = redub::dub(&url, &output).await?;

    println!("{}", outcome.video_path.display());

    Ok(())
}
