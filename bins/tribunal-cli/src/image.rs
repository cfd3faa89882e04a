// Sandbox image generation and build
use anyhow::{bail, Context, Result};
use handlebars::Handlebars;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tribunal_common::config::{JudgeSettings, LanguageConfig, LanguageConfigManager};
use tribunal_common::types::Language;

const TEMPLATE_PATH: &str = "config/templates/Dockerfile.tmpl";

fn language_config(language: &str) -> Result<LanguageConfig> {
    let parsed = Language::parse(language).with_context(|| format!("Unknown language '{}'", language))?;
    let settings = JudgeSettings::from_env()?;
    let languages = LanguageConfigManager::load(&settings.languages_path)?;
    Ok(languages.get_config(&parsed)?.clone())
}

fn default_dockerfile_path(config: &LanguageConfig) -> PathBuf {
    PathBuf::from(format!("dockerfiles/{}/Dockerfile", config.name))
}

pub fn render(template: &str, config: &LanguageConfig) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);

    let mut data = HashMap::new();
    data.insert("name", config.name.as_str());
    data.insert("version", config.version.as_str());
    data.insert("interpreter", config.interpreter.as_str());

    handlebars
        .render_template(template, &data)
        .context("Failed to render Dockerfile template")
}

/// `{repo}:{version}-v1` and `{repo}:latest`, where repo is the configured image minus its tag
pub fn image_tags(config: &LanguageConfig) -> (String, String) {
    let repo = match config.image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => config.image.as_str(),
    };
    (
        format!("{}:{}-v1", repo, config.version),
        format!("{}:latest", repo),
    )
}

fn write_dockerfile(config: &LanguageConfig, output: Option<&Path>) -> Result<PathBuf> {
    let template = fs::read_to_string(TEMPLATE_PATH)
        .with_context(|| format!("Failed to read template {}", TEMPLATE_PATH))?;
    let dockerfile = render(&template, config)?;

    let path = output.map(Path::to_path_buf).unwrap_or_else(|| default_dockerfile_path(config));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, dockerfile).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub fn render_dockerfile(language: &str, output: Option<&Path>) -> Result<()> {
    let config = language_config(language)?;
    let path = write_dockerfile(&config, output)?;
    println!("✅ Dockerfile written to {}", path.display());
    Ok(())
}

pub fn build_image(language: &str, no_cache: bool) -> Result<()> {
    let config = language_config(language)?;
    println!("🐳 Building sandbox image for: {}", config.name);

    let dockerfile_path = write_dockerfile(&config, None)?;
    let (image_versioned, image_latest) = image_tags(&config);

    println!("📦 Building tags:");
    println!("  - {}", image_versioned);
    println!("  - {}", image_latest);

    let mut docker_args = vec![
        "build".to_string(),
        "-t".to_string(),
        image_versioned.clone(),
        "-t".to_string(),
        image_latest.clone(),
        "-f".to_string(),
        dockerfile_path.to_string_lossy().to_string(),
    ];
    if no_cache {
        docker_args.push("--no-cache".to_string());
    }
    // The image copies nothing in, so the Dockerfile's directory is the whole context
    let context_dir = dockerfile_path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());
    docker_args.push(context_dir);

    println!("\n🔨 Running: docker {}", docker_args.join(" "));

    let status = Command::new("docker")
        .args(&docker_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute docker build. Is Docker installed and running?")?;

    if !status.success() {
        bail!("Docker build failed with exit code: {:?}", status.code());
    }

    println!("\n✅ Docker image built successfully!");
    if config.image != image_latest && config.image != image_versioned {
        println!(
            "⚠️  config/languages.json points at {}, which this build did not tag",
            config.image
        );
    }
    Ok(())
}
