use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::container::ImageResponse;
use crate::decoding::{ImageDecodingContext, decode_response};
use crate::decompression::decompress_response;
use crate::disk_cache::DataCacheItem;
use crate::encoding::ImageEncodingContext;
use crate::pipeline::{ImageResponseTask, PipelineInner};
use crate::request::ImageRequest;
use crate::task::Task;

/// Produces the final, decompressed image for a request and keeps both
/// caches up to date.
pub(crate) struct LoadImage {
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    task: ImageResponseTask,
}

impl LoadImage {
    pub(crate) fn task(pipeline: Arc<PipelineInner>, request: ImageRequest) -> ImageResponseTask {
        Task::new(move |task| {
            Arc::new(Self {
                pipeline,
                request,
                task,
            })
            .start()
        })
    }

    fn start(self: Arc<Self>) {
        if let Some(container) = self.pipeline.cached_image(&self.request) {
            let is_preview = container.is_preview;
            trace!(url = %self.request.url(), is_preview, "Memory cache hit");
            self.task
                .send_value(ImageResponse::new(container, None), !is_preview);
            if !is_preview {
                return;
            }
        }

        let cache = self
            .pipeline
            .config
            .data_cache_for(DataCacheItem::FinalImage)
            .filter(|_| self.request.is_cache_lookup_allowed())
            .cloned();
        let Some(cache) = cache else {
            self.load_decompressed_image();
            return;
        };

        let key = self.request.cache_key_for_final_image_data();
        let this = self.clone();
        let operation = self.pipeline.queues.data_caching.add_block_delivering(
            &self.pipeline.serial,
            move || cache.cached_data(&key),
            move |data| match data {
                Some(data) => this.decode_processed_image_data(data),
                None => this.load_decompressed_image(),
            },
        );
        self.task.set_operation(&operation);
    }

    fn decode_processed_image_data(self: &Arc<Self>, data: Bytes) {
        if self.task.is_disposed() {
            return;
        }

        let context = ImageDecodingContext {
            request: self.request.clone(),
            data: data.clone(),
            is_completed: true,
            url_response: None,
        };
        let Some(decoder) = self.pipeline.config.make_image_decoder(&context) else {
            self.load_decompressed_image();
            return;
        };

        let this = self.clone();
        let operation = self.pipeline.queues.decoding.add_block_delivering(
            &self.pipeline.serial,
            move || decode_response(&*decoder, &data, None, true),
            move |response| match response {
                Some(response) => {
                    trace!(url = %this.request.url(), "Decoded processed image from disk cache");
                    this.decompress_processed_image(response, true);
                }
                None => this.load_decompressed_image(),
            },
        );
        self.task.set_operation(&operation);
    }

    fn load_decompressed_image(self: &Arc<Self>) {
        let this = self.clone();
        let dependency = self
            .pipeline
            .make_task_process_image(self.request.clone())
            .publisher()
            .subscribe_task(&self.task, move |response, is_completed| {
                this.store_image_in_data_cache(&response);
                this.decompress_processed_image(response, is_completed);
            });
        self.task.set_dependency(dependency);
    }

    fn decompress_processed_image(self: &Arc<Self>, response: ImageResponse, is_completed: bool) {
        if !self.pipeline.is_decompression_needed(&self.request, &response) {
            self.pipeline
                .store_response(&response.container, &self.request);
            self.task.send_value(response, is_completed);
            return;
        }

        if is_completed {
            if let Some(operation) = self.task.operation() {
                operation.cancel();
            }
        } else if self.task.operation().is_some() {
            return;
        }

        if self.task.is_disposed() {
            return;
        }

        let decompressor = self.pipeline.config.decompressor.clone();
        let this = self.clone();
        let operation = self.pipeline.queues.decompressing.add_block_delivering(
            &self.pipeline.serial,
            move || decompress_response(&*decompressor, &response),
            move |response| {
                this.pipeline
                    .store_response(&response.container, &this.request);
                this.task.send_value(response, is_completed);
            },
        );
        self.task.set_operation(&operation);
    }

    /// Encode and store the processed image. Fire and forget.
    fn store_image_in_data_cache(&self, response: &ImageResponse) {
        if response.is_preview() {
            return;
        }
        let Some(cache) = self
            .pipeline
            .config
            .data_cache_for(DataCacheItem::FinalImage)
            .cloned()
        else {
            return;
        };
        // Without processors the final key is the original key, which already
        // holds the downloaded bytes.
        if self.request.processors().is_empty()
            && self
                .pipeline
                .config
                .data_cache_for(DataCacheItem::OriginalImageData)
                .is_some()
        {
            return;
        }

        let context = ImageEncodingContext {
            request: self.request.clone(),
            image: response.container.image.clone(),
            url_response: response.url_response.clone(),
        };
        let encoder = self.pipeline.config.make_image_encoder(&context);
        let container = response.container.clone();
        let key = self.request.cache_key_for_final_image_data();
        self.pipeline.queues.encoding.add_block(move || {
            match encoder.encode(&container, &context) {
                Some(data) => cache.store_data(data, &key),
                None => warn!(key = %key, "Failed to encode image for the disk cache"),
            }
        });
    }
}
