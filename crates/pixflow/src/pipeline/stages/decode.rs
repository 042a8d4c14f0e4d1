use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::container::ImageData;
use crate::decoding::{ImageDecoding, ImageDecodingContext, decode_response};
use crate::error::PipelineError;
use crate::pipeline::{ImageResponseTask, PipelineInner};
use crate::request::ImageRequest;
use crate::task::Task;

/// Decodes the original bytes, producing previews for progressive data when
/// enabled.
pub(crate) struct DecodeImage {
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    task: ImageResponseTask,
    decoder: Mutex<Option<Arc<dyn ImageDecoding>>>,
}

impl DecodeImage {
    pub(crate) fn task(pipeline: Arc<PipelineInner>, request: ImageRequest) -> ImageResponseTask {
        Task::new(move |task| {
            Arc::new(Self {
                pipeline,
                request,
                task,
                decoder: Mutex::new(None),
            })
            .start()
        })
    }

    fn start(self: Arc<Self>) {
        let this = self.clone();
        let dependency = self
            .pipeline
            .make_task_load_image_data(self.request.clone())
            .publisher()
            .subscribe_task(&self.task, move |data, is_completed| {
                this.did_receive_data(data, is_completed)
            });
        self.task.set_dependency(dependency);
    }

    fn did_receive_data(self: &Arc<Self>, data: ImageData, is_completed: bool) {
        if !is_completed && !self.pipeline.config.settings.is_progressive_decoding_enabled {
            return;
        }
        if is_completed {
            if let Some(operation) = self.task.operation() {
                trace!(url = %self.request.url(), "Final data supersedes partial decode");
                operation.cancel();
            }
        } else if self.task.operation().is_some() {
            return;
        }

        if data.data.is_empty() {
            if is_completed {
                self.task.send_error(PipelineError::DecodingFailed);
            }
            return;
        }

        let Some(decoder) = self.decoder(&data, is_completed) else {
            if is_completed {
                debug!(url = %self.request.url(), "No decoder for image data");
                self.task.send_error(PipelineError::DecodingFailed);
            }
            return;
        };

        let this = self.clone();
        let operation = self.pipeline.queues.decoding.add_block_delivering(
            &self.pipeline.serial,
            move || decode_response(&*decoder, &data.data, data.response, is_completed),
            move |response| match response {
                Some(response) => this.task.send_value(response, is_completed),
                None if is_completed => {
                    debug!(url = %this.request.url(), "Failed to decode image data");
                    this.task.send_error(PipelineError::DecodingFailed);
                }
                None => {}
            },
        );
        self.task.set_operation(&operation);
    }

    /// The decoder is chosen on the first chunk and reused afterwards.
    fn decoder(&self, data: &ImageData, is_completed: bool) -> Option<Arc<dyn ImageDecoding>> {
        let mut decoder = self.decoder.lock();
        if let Some(decoder) = decoder.as_ref() {
            return Some(decoder.clone());
        }
        let context = ImageDecodingContext {
            request: self.request.clone(),
            data: data.data.clone(),
            is_completed,
            url_response: data.response.clone(),
        };
        *decoder = self.pipeline.config.make_image_decoder(&context);
        decoder.clone()
    }
}
