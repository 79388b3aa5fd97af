use rand::Rng;

use crate::error::Result;
use crate::workflow::{InputValue, Node, Workflow, WorkflowBuilder};

/// Builder for a txt2img ComfyUI workflow.
///
/// Constructs a standard 7-node pipeline: CheckpointLoader → CLIP encoders
/// → KSampler → VAEDecode → SaveImage.
///
/// # Example
/// ```
/// use comfyui_client::Txt2ImgRequest;
///
/// let (workflow, seed) = Txt2ImgRequest::new("a cat in space", "dreamshaper_8.safetensors")
///     .negative("lowres, blurry")
///     .size(512, 768)
///     .steps(25)
///     .cfg_scale(7.5)
///     .build()
///     .unwrap();
///
/// assert!(seed >= 0);
/// assert!(workflow.node("1").is_some()); // CheckpointLoader node
/// ```
#[derive(Debug, Clone)]
pub struct Txt2ImgRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub checkpoint: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub scheduler: String,
    pub seed: i64,
    pub batch_size: u32,
    pub filename_prefix: String,
}

impl Txt2ImgRequest {
    /// Create a new request with a prompt and checkpoint. Uses sensible defaults
    /// for all other parameters (512x768, 25 steps, cfg 7.5, dpmpp_2m/karras).
    pub fn new(prompt: impl Into<String>, checkpoint: impl Into<String>) -> Self {
        Self {
            positive_prompt: prompt.into(),
            negative_prompt: String::new(),
            checkpoint: checkpoint.into(),
            width: 512,
            height: 768,
            steps: 25,
            cfg_scale: 7.5,
            sampler: "dpmpp_2m".to_string(),
            scheduler: "karras".to_string(),
            seed: -1,
            batch_size: 1,
            filename_prefix: "ComfyUI".to_string(),
        }
    }

    /// Set the negative prompt.
    pub fn negative(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = prompt.into();
        self
    }

    /// Set output dimensions.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the number of sampling steps.
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Set the classifier-free guidance scale.
    pub fn cfg_scale(mut self, cfg: f64) -> Self {
        self.cfg_scale = cfg;
        self
    }

    /// Set the sampler algorithm (e.g. "euler", "dpmpp_2m", "dpmpp_sde").
    pub fn sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = sampler.into();
        self
    }

    /// Set the noise scheduler (e.g. "normal", "karras", "exponential").
    pub fn scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = scheduler.into();
        self
    }

    /// Set a specific seed. Use -1 (the default) for random.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the batch size (number of images per generation).
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the output filename prefix in ComfyUI.
    pub fn filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filename_prefix = prefix.into();
        self
    }

    /// Build the workflow graph and resolve the seed.
    ///
    /// Returns `(workflow, actual_seed)`. When `seed` is -1, a random
    /// seed is generated and returned so it can be stored with the image.
    pub fn build(&self) -> Result<(Workflow, i64)> {
        let seed = if self.seed < 0 {
            rand::rng().random_range(0..i64::MAX)
        } else {
            self.seed
        };

        let mut b = WorkflowBuilder::new();
        let ckpt = b.add_node(
            "CheckpointLoaderSimple",
            [("ckpt_name", InputValue::from(self.checkpoint.as_str()))],
        );
        let latent = b.add_node(
            "EmptyLatentImage",
            [
                ("width", InputValue::from(self.width)),
                ("height", InputValue::from(self.height)),
                ("batch_size", InputValue::from(self.batch_size)),
            ],
        );
        let positive = b.add_node(
            "CLIPTextEncode",
            [("text", InputValue::from(self.positive_prompt.as_str()))],
        );
        let negative = b.add_node(
            "CLIPTextEncode",
            [("text", InputValue::from(self.negative_prompt.as_str()))],
        );
        b.connect(&ckpt, 1, &positive, "clip")?;
        b.connect(&ckpt, 1, &negative, "clip")?;

        let sampler = b.add_node(
            "KSampler",
            [
                ("seed", InputValue::from(seed)),
                ("steps", InputValue::from(self.steps)),
                ("cfg", InputValue::from(self.cfg_scale)),
                ("sampler_name", InputValue::from(self.sampler.as_str())),
                ("scheduler", InputValue::from(self.scheduler.as_str())),
                ("denoise", InputValue::from(1.0)),
            ],
        );
        b.connect(&ckpt, 0, &sampler, "model")?;
        b.connect(&positive, 0, &sampler, "positive")?;
        b.connect(&negative, 0, &sampler, "negative")?;
        b.connect(&latent, 0, &sampler, "latent_image")?;

        let decode = b.push(Node::new("VAEDecode"));
        b.connect(&sampler, 0, &decode, "samples")?;
        b.connect(&ckpt, 2, &decode, "vae")?;

        let save = b.add_node(
            "SaveImage",
            [("filename_prefix", InputValue::from(self.filename_prefix.as_str()))],
        );
        b.connect(&decode, 0, &save, "images")?;

        Ok((b.build(), seed))
    }
}
