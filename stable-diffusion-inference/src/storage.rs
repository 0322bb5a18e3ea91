use {
    std::{collections::HashMap, path::{Path, PathBuf}},
    tracing::info,
    serde::{Deserialize, Serialize},
    tokio::{fs, io::AsyncWriteExt},
    indicatif::ProgressBar,
    candle::Tensor,
    crate::error::{Error, Result},
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub cache_dir: String,
    pub endpoint: String,
    pub revision: String,
    pub token: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cache_dir: "data/model".to_owned(),
            endpoint: "https://huggingface.co".to_owned(),
            revision: "main".to_owned(),
            token: None,
        }
    }
}

/// Local cache of model files, filled from a Hugging Face compatible endpoint on first use.
pub struct Storage {
    client: reqwest::Client,
    settings: StorageSettings,
}

impl Storage {
    pub fn new(settings: StorageSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn local_path(&self, repo: &str, file_name: &str) -> PathBuf {
        Path::new(&self.settings.cache_dir).join(repo).join(file_name)
    }

    fn remote_url(&self, repo: &str, file_name: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.settings.endpoint.trim_end_matches('/'),
            repo,
            self.settings.revision,
            file_name,
        )
    }

    pub async fn load_model_file(&self, repo: &str, file_name: &str) -> Result<PathBuf> {
        let file_path = self.local_path(repo, file_name);
        if file_path.exists() {
            return Ok(file_path);
        }

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!("downloading file \"{}\" for model {}", file_name, repo);

        let name = format!("{}/{}", repo, file_name);
        let mut request = self.client.get(self.remote_url(repo, file_name));
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }

        let mut response = request.send().await
            .and_then(|response| response.error_for_status())
            .map_err(|source| Error::Download { name: name.clone(), source })?;

        let progress = match response.content_length() {
            Some(size) => ProgressBar::new(size),
            None => ProgressBar::new_spinner(),
        };

        // partial downloads never land under the final name
        let temp_path = file_path.with_extension("part");
        let mut file = fs::File::create(&temp_path).await?;

        while let Some(chunk) = response.chunk().await.map_err(|source| Error::Download { name: name.clone(), source })? {
            file.write_all(&chunk).await?;
            progress.inc(chunk.len() as u64);
        }
        file.flush().await?;
        progress.finish_and_clear();

        fs::rename(&temp_path, &file_path).await?;

        info!("finished downloading file \"{}\"", file_name);

        Ok(file_path)
    }

    /// Resolves a weights file the way `load_model_file` does. Pickled PyTorch checkpoints (`.bin`)
    /// are converted once into a `.safetensors` file next to them, which is what gets returned.
    pub async fn load_weights(&self, repo: &str, file_name: &str) -> Result<PathBuf> {
        let file_path = self.load_model_file(repo, file_name).await?;
        if file_path.extension().map_or(true, |extension| extension != "bin") {
            return Ok(file_path);
        }

        let converted_path = file_path.with_extension("safetensors");
        if converted_path.exists() {
            return Ok(converted_path);
        }

        info!("converting \"{}\" for model {} to safetensors", file_name, repo);

        let tensors: HashMap<String, Tensor> = candle::pickle::read_all(&file_path)?.into_iter().collect();
        let temp_path = file_path.with_extension("safetensors.part");
        candle::safetensors::save(&tensors, &temp_path)?;
        fs::rename(&temp_path, &converted_path).await?;

        Ok(converted_path)
    }
}
