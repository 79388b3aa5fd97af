//! Demonstrate the workflow builder and model discovery.
//!
//! Lists available checkpoints, samplers, and schedulers, builds a
//! customized txt2img workflow, then wires an upscale graph by hand and
//! saves both as API-format JSON.
//!
//! ```sh
//! cargo run --example workflow_builder
//! ```

use comfyui_client::{ComfyClient, InputValue, Txt2ImgRequest, WorkflowBuilder};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = ComfyClient::new("http://127.0.0.1:8188");

    // Discover available options
    let checkpoints = client.checkpoints().await?;
    let samplers = client.samplers().await?;
    let schedulers = client.schedulers().await?;

    println!("Checkpoints ({}):", checkpoints.len());
    for c in &checkpoints {
        println!("  - {}", c);
    }
    println!("\nSamplers ({}):", samplers.len());
    for s in &samplers {
        println!("  - {}", s);
    }
    println!("\nSchedulers ({}):", schedulers.len());
    for s in &schedulers {
        println!("  - {}", s);
    }

    let Some(checkpoint) = checkpoints.first() else {
        eprintln!("\nNo checkpoints found, install a model first");
        return Ok(());
    };

    // Build a fully customized request
    let request = Txt2ImgRequest::new("masterpiece, best quality, landscape painting", checkpoint)
        .negative("lowres, blurry, bad anatomy, watermark")
        .size(1024, 1024)
        .steps(30)
        .cfg_scale(7.0)
        .sampler("dpmpp_2m")
        .scheduler("karras")
        .seed(42)
        .batch_size(2)
        .filename_prefix("my-project");

    let (workflow, seed) = request.build()?;
    println!("\nWorkflow JSON:");
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    println!("\nSeed: {}", seed);
    workflow.to_file("txt2img.json")?;

    // Wire a graph by hand: load an image, upscale it, save it.
    let mut b = WorkflowBuilder::new();
    let load = b.add_node("LoadImage", [("image", InputValue::from("input.png"))]);
    let upscale = b.add_node(
        "ImageScaleBy",
        [
            ("upscale_method", InputValue::from("lanczos")),
            ("scale_by", InputValue::from(2.0)),
        ],
    );
    let save = b.add_node("SaveImage", [("filename_prefix", InputValue::from("upscaled"))]);
    b.connect(&load, 0, &upscale, "image")?;
    b.connect(&upscale, 0, &save, "images")?;

    let upscale_graph = b.build();
    upscale_graph.validate()?;
    upscale_graph.to_file("upscale.json")?;
    println!("\nSaved txt2img.json and upscale.json ({} nodes)", upscale_graph.len());

    Ok(())
}
