use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use pixflow::disk_cache::{DataCache, DataCaching};
use pixflow::encoding::DefaultEncoder;
use pixflow::processing::{Circle, ImageProcessing, Resize, RoundedCorners};
use pixflow::{
    CachePolicy, ImageRequest, ImageResponse, ImageTaskEvent, ImageType, Pipeline, PipelineConfig,
    PipelineSettings, PrefetchDestination, Prefetcher,
};
use tracing::{debug, error, info};
use url::Url;

use crate::cli::CacheAction;
use crate::error::{AppError, Result};

/// What to apply to every fetched image.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub resize: Option<(u32, u32)>,
    pub crop: bool,
    pub circle: bool,
    pub rounded: Option<u32>,
    pub reload: bool,
}

impl FetchOptions {
    fn processors(&self) -> Vec<Arc<dyn ImageProcessing>> {
        let mut processors: Vec<Arc<dyn ImageProcessing>> = Vec::new();
        if let Some((width, height)) = self.resize {
            processors.push(Arc::new(Resize::new(width, height).with_crop(self.crop)));
        }
        if self.circle {
            processors.push(Arc::new(Circle::default()));
        } else if let Some(radius) = self.rounded {
            processors.push(Arc::new(RoundedCorners::new(radius)));
        }
        processors
    }

    fn request(&self, url: Url) -> ImageRequest {
        let request = ImageRequest::new(url).with_processors(self.processors());
        if self.reload {
            request.with_cache_policy(CachePolicy::ReloadIgnoringCachedData)
        } else {
            request
        }
    }
}

/// A pipeline together with the disk cache it writes to.
pub struct CommandExecutor {
    pipeline: Pipeline,
    disk_cache: DataCache,
}

impl CommandExecutor {
    pub fn new(mut settings: PipelineSettings) -> Result<Self> {
        let disk_cache = DataCache::new(settings.disk_cache.take().unwrap_or_default())?;
        let config = PipelineConfig::from_settings(settings)?
            .with_data_cache(Arc::new(disk_cache.clone()));
        Ok(Self {
            pipeline: Pipeline::new(config),
            disk_cache,
        })
    }

    pub async fn fetch(&self, urls: Vec<Url>, output_dir: &Path, options: &FetchOptions) -> Result<()> {
        tokio::fs::create_dir_all(output_dir).await?;

        let progress = MultiProgress::new();
        let total = urls.len();
        let loads = urls.into_iter().enumerate().map(|(index, url)| {
            let bar = progress.add(ProgressBar::new(0));
            self.fetch_one(index, url, output_dir, options, bar)
        });
        let results = join_all(loads).await;
        self.disk_cache.flush();

        let failed = results.iter().filter(|result| result.is_err()).count();
        for error in results.iter().filter_map(|result| result.as_ref().err()) {
            error!("{error}");
        }
        if failed > 0 {
            return Err(AppError::Failures { failed, total });
        }
        Ok(())
    }

    async fn fetch_one(
        &self,
        index: usize,
        url: Url,
        output_dir: &Path,
        options: &FetchOptions,
        bar: ProgressBar,
    ) -> Result<PathBuf> {
        bar.set_style(download_style());
        bar.set_message(url.to_string());

        let mut task = self.pipeline.load_image(options.request(url.clone()));
        let mut result = None;
        while let Some(event) = task.next_event().await {
            match event {
                ImageTaskEvent::Progress(progress) => {
                    bar.set_length(progress.total);
                    bar.set_position(progress.completed);
                }
                ImageTaskEvent::IntermediateResponse(response) => {
                    debug!(url = %url, width = response.image().width(), "Preview received");
                }
                ImageTaskEvent::Completed(completed) => {
                    result = Some(completed);
                    break;
                }
                _ => {}
            }
        }

        let response = match result {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                bar.abandon_with_message(format!("{url}: {e}"));
                return Err(e.into());
            }
            None => {
                bar.abandon_with_message(format!("{url}: cancelled"));
                return Err(AppError::Cancelled(url.to_string()));
            }
        };

        let stem = file_stem(&url, index);
        let path = tokio::task::spawn_blocking({
            let output_dir = output_dir.to_path_buf();
            move || write_image(&response, &output_dir, &stem)
        })
        .await??;

        bar.finish_with_message(format!("{url} -> {}", path.display()));
        Ok(path)
    }

    pub async fn prefetch(
        &self,
        urls: Vec<Url>,
        destination: PrefetchDestination,
        max_concurrent: usize,
    ) -> Result<()> {
        let count = urls.len();
        let prefetcher = Prefetcher::new(self.pipeline.clone(), destination, max_concurrent);
        prefetcher.start_prefetching(urls.into_iter().map(ImageRequest::new));

        let spinner = ProgressBar::new_spinner();
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        while !prefetcher.is_empty() {
            spinner.set_message(format!("Prefetching, {} remaining", prefetcher.len()));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.disk_cache.flush();

        spinner.finish_with_message(format!("Prefetched {count} images"));
        info!(count, ?destination, "Prefetch finished");
        Ok(())
    }

    pub fn cache(&self, action: CacheAction) -> Result<()> {
        match action {
            CacheAction::Stats => {
                println!("Path:    {}", self.disk_cache.path().display());
                println!("Entries: {}", self.disk_cache.total_count());
                println!("Size:    {}", HumanBytes(self.disk_cache.total_size()));
            }
            CacheAction::Sweep => {
                let removed = self.disk_cache.sweep()?;
                println!("Removed {removed} entries");
            }
            CacheAction::Clear => {
                self.disk_cache.remove_all();
                self.disk_cache.flush();
                println!("Cleared {}", self.disk_cache.path().display());
            }
        }
        Ok(())
    }
}

fn download_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}\n{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Last path segment without its extension, or `image-{index}`.
fn file_stem(url: &Url, index: usize) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(|stem| format!("{index:03}-{stem}"))
        .unwrap_or_else(|| format!("image-{index:03}"))
}

fn write_image(response: &ImageResponse, output_dir: &Path, stem: &str) -> Result<PathBuf> {
    let data = DefaultEncoder::default()
        .encode_image(response.image())
        .ok_or_else(|| AppError::Encode(stem.to_owned()))?;
    let extension = ImageType::sniff(&data).map_or("bin", ImageType::extension);
    let path = output_dir.join(format!("{stem}.{extension}"));
    std::fs::write(&path, &data)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stems() {
        let url = Url::parse("https://example.com/photos/cat.jpg?size=large").unwrap();
        assert_eq!(file_stem(&url, 1), "001-cat");

        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(file_stem(&url, 7), "image-007");
    }

    #[test]
    fn processors_follow_options() {
        let options = FetchOptions {
            resize: Some((10, 10)),
            rounded: Some(4),
            ..Default::default()
        };
        assert_eq!(options.processors().len(), 2);

        let options = FetchOptions {
            circle: true,
            rounded: Some(4),
            ..Default::default()
        };
        let processors = options.processors();
        assert_eq!(processors.len(), 1);
        assert_eq!(processors[0].identifier(), "pixflow/circle");
    }

    #[test]
    fn reload_skips_cache_lookups() {
        let url = Url::parse("https://example.com/a.png").unwrap();
        let options = FetchOptions {
            reload: true,
            ..Default::default()
        };
        assert!(!options.request(url.clone()).is_cache_lookup_allowed());
        assert!(FetchOptions::default().request(url).is_cache_lookup_allowed());
    }

    #[test]
    fn writes_png_for_alpha_images() {
        let dir = tempfile::tempdir().unwrap();
        let image = image::DynamicImage::new_rgba8(4, 4);
        let response = ImageResponse::new(pixflow::ImageContainer::new(image), None);

        let path = write_image(&response, dir.path(), "out").unwrap();
        assert_eq!(path, dir.path().join("out.png"));
        assert!(path.exists());
    }
}
