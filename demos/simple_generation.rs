//! Generate a single image from a text prompt.
//!
//! Requires a running ComfyUI instance at http://127.0.0.1:8188
//! with at least one checkpoint installed.
//!
//! ```sh
//! cargo run --example simple_generation
//! ```

use comfyui_client::{ComfyClient, Txt2ImgRequest, WaitOptions};
use std::time::Duration;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = ComfyClient::new("http://127.0.0.1:8188");

    // Check connection
    if !client.health().await? {
        eprintln!("ComfyUI is not responding");
        return Ok(());
    }
    println!("ComfyUI is online");

    let checkpoints = client.checkpoints().await?;
    let Some(checkpoint) = checkpoints.first() else {
        eprintln!("No checkpoints found, install a model first");
        return Ok(());
    };
    println!("Using checkpoint: {}", checkpoint);

    let (workflow, seed) = Txt2ImgRequest::new("a beautiful sunset over mountains", checkpoint)
        .negative("lowres, blurry, bad anatomy")
        .steps(25)
        .cfg_scale(7.5)
        .build()?;
    println!("Seed: {}", seed);

    let opts = WaitOptions::new().with_timeout(Duration::from_secs(120));
    let result = client.execute(&workflow, opts, |_| {}).await?;

    println!(
        "Generated {} image(s) in {:.1}s",
        result.images.len(),
        result.duration.as_secs_f64()
    );
    for img in &result.images {
        client.save_image(img, &img.filename).await?;
        println!("Saved: {}", img.filename);
    }

    Ok(())
}
