//! Dub with a fixed direction, custom voices and the Hume analyzer, printing
//! each stage transition as it happens.
//!
//! Usage: cargo run --example options -- https://youtu.be/VIDEO_ID

use std::sync::Arc;

use async_trait::async_trait;
use redub::pipeline::ObserverError;
use redub::workspace::SessionDir;
use redub::{
    AnalyzerChoice, Direction, DubOptions, Gender, Language, PipelineStage, Pipeline,
    ProviderConfig, StageObserver, VoiceMap,
};

struct PrintStages;

#[async_trait]
impl StageObserver for PrintStages {
    async fn on_stage(&self, stage: &PipelineStage) -> Result<(), ObserverError> {
        println!("{}", serde_json::to_string(stage)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> redub::Result<()> {
    let url = std::env::args()
        .nth(1)
        .expect("usage: options <url>");

    let voices = VoiceMap::new()
        .with_voice(Language::Ru, Gender::Male, "onyx")
        .with_voice(Language::Ru, Gender::Female, "nova");
    let options = DubOptions::new()
        .direction(Direction::parse("en-ru")?)
        .voices(voices)
        .analyzer(AnalyzerChoice::Hume)
        .max_concurrency(2)?;

    let mut session = SessionDir::create(&options.resolve_work_root())?;
    session.keep();

    let pipeline = Pipeline::from_config(Arc::new(ProviderConfig::from_env()), options);
    match pipeline.run(&url, session.path(), Some(&PrintStages)).await {
        Ok(outcome) => println!("dubbed: {}", outcome.video_path.display()),
        Err(failure) => eprintln!("failed: {failure}"),
    }

    Ok(())
}
