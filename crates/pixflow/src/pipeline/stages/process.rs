use std::sync::Arc;

use tracing::debug;

use crate::container::ImageResponse;
use crate::error::PipelineError;
use crate::pipeline::{ImageResponseTask, PipelineInner};
use crate::processing::{Composition, ImageProcessing, ImageProcessingContext};
use crate::request::ImageRequest;
use crate::task::Task;

/// Applies the request's processors on top of the image its parent request
/// produces.
///
/// With deduplication, only the last processor runs here and the rest is
/// another pooled task, so requests sharing a processor prefix share work.
pub(crate) struct ProcessImage {
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    task: ImageResponseTask,
}

impl ProcessImage {
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
        debug_assert!(!self.request.processors().is_empty());
        if self.task.is_disposed() {
            return;
        }

        if let Some(container) = self.pipeline.cached_image(&self.request)
            && !container.is_preview
        {
            self.task
                .send_value(ImageResponse::new(container, None), true);
            return;
        }

        let (processor, parent): (Arc<dyn ImageProcessing>, ImageRequest) =
            if self.pipeline.config.settings.is_deduplication_enabled {
                let Some(last) = self.request.processors().last().cloned() else {
                    return;
                };
                (last, self.request.without_last_processor())
            } else {
                let mut parent = self.request.clone();
                parent.set_processors(Vec::new());
                let composition = Composition::new(self.request.processors().to_vec());
                (Arc::new(composition) as Arc<dyn ImageProcessing>, parent)
            };

        let this = self.clone();
        let dependency = self
            .pipeline
            .make_task_process_image(parent)
            .publisher()
            .subscribe_task(&self.task, move |response, is_completed| {
                this.process_image(response, is_completed, processor.clone())
            });
        self.task.set_dependency(dependency);
    }

    fn process_image(
        self: &Arc<Self>,
        response: ImageResponse,
        is_completed: bool,
        processor: Arc<dyn ImageProcessing>,
    ) {
        if self.pipeline.config.settings.is_animated_image_data_enabled {
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

        let context = ImageProcessingContext {
            request: self.request.clone(),
            url_response: response.url_response.clone(),
            is_final: is_completed,
        };
        let this = self.clone();
        let operation = self.pipeline.queues.processing.add_block_delivering(
            &self.pipeline.serial,
            move || {
                let container = processor.process_container(&response.container, &context)?;
                Some(ImageResponse::new(container, response.url_response))
            },
            move |processed| match processed {
                Some(response) => this.task.send_value(response, is_completed),
                None if is_completed => {
                    debug!(
                        url = %this.request.url(),
                        processors = ?this.request.processors(),
                        "Failed to process image"
                    );
                    this.task.send_error(PipelineError::ProcessingFailed);
                }
                None => {}
            },
        );
        self.task.set_operation(&operation);
    }
}
