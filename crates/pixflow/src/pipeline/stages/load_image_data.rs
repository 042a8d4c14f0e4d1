use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::container::ImageData;
use crate::disk_cache::DataCacheItem;
use crate::error::{LoadError, PipelineError};
use crate::loader::{LoadRequest, UrlResponse};
use crate::operation::FinishHandle;
use crate::pipeline::{ImageDataTask, PipelineInner};
use crate::request::ImageRequest;
use crate::resumable::{ResumableData, ResumableDataStorage};
use crate::task::{Task, TaskProgress};

#[derive(Default)]
struct Download {
    url_response: Option<UrlResponse>,
    resumable: Option<ResumableData>,
    resumed_len: u64,
    data: BytesMut,
}

/// Fetches the original bytes, from the disk cache or the network.
pub(crate) struct LoadImageData {
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    task: ImageDataTask,
    download: Mutex<Download>,
}

impl LoadImageData {
    pub(crate) fn task(pipeline: Arc<PipelineInner>, request: ImageRequest) -> ImageDataTask {
        Task::new(move |task| {
            Arc::new(Self {
                pipeline,
                request,
                task,
                download: Mutex::new(Download::default()),
            })
            .start()
        })
    }

    fn start(self: Arc<Self>) {
        let cache = self
            .pipeline
            .config
            .data_cache_for(DataCacheItem::OriginalImageData)
            .filter(|_| self.request.is_cache_lookup_allowed())
            .cloned();
        let Some(cache) = cache else {
            self.load_data();
            return;
        };

        let key = self.request.cache_key_for_original_image_data();
        let this = self.clone();
        let operation = self.pipeline.queues.data_caching.add_block_delivering(
            &self.pipeline.serial,
            move || cache.cached_data(&key),
            move |data| match data {
                Some(data) => {
                    trace!(url = %this.request.url(), "Original data found in disk cache");
                    this.task.send_value(ImageData { data, response: None }, true);
                }
                None => this.load_data(),
            },
        );
        self.task.set_operation(&operation);
    }

    fn load_data(self: &Arc<Self>) {
        let Some(limiter) = &self.pipeline.rate_limiter else {
            self.actually_load_data();
            return;
        };
        let this = self.clone();
        limiter.execute(move || {
            if this.task.is_disposed() {
                return false;
            }
            this.actually_load_data();
            true
        });
    }

    fn actually_load_data(self: &Arc<Self>) {
        let this = self.clone();
        let operation = self.pipeline.queues.data_loading.add_starter(move |finish| {
            let serial = this.pipeline.serial.clone();
            serial.dispatch(move || this.load_image_data(finish));
        });
        self.task.set_operation(&operation);
    }

    fn load_image_data(self: Arc<Self>, finish: FinishHandle) {
        if self.task.is_disposed() {
            finish.finish();
            return;
        }

        let mut headers = self.request.headers().clone();
        if self.pipeline.config.settings.is_resumable_data_enabled
            && let Some(resumable) =
                ResumableDataStorage::shared().remove_resumable_data(&self.request, self.pipeline.id())
        {
            debug!(
                url = %self.request.url(),
                bytes = resumable.data.len(),
                "Resuming download"
            );
            resumable.resume(&mut headers);
            self.download.lock().resumable = Some(resumable);
        }

        let on_chunk = {
            let this = self.clone();
            Box::new(move |chunk: Bytes, response: UrlResponse| {
                let stage = this.clone();
                this.pipeline
                    .serial
                    .dispatch(move || stage.did_receive_data(chunk, response));
            })
        };
        let on_completion = {
            let this = self.clone();
            let finish = finish.clone();
            Box::new(move |result: Result<(), LoadError>| {
                finish.finish();
                let serial = this.pipeline.serial.clone();
                serial.dispatch(move || this.did_finish(result));
            })
        };

        let handle = self.pipeline.config.data_loader.load_data(
            LoadRequest {
                url: self.request.url().clone(),
                headers,
            },
            on_chunk,
            on_completion,
        );

        let this = self.clone();
        self.task.set_on_cancelled(move || {
            handle.cancel();
            finish.finish();
            this.try_to_save_resumable_data();
        });
    }

    fn did_receive_data(&self, chunk: Bytes, response: UrlResponse) {
        if self.task.is_disposed() {
            return;
        }

        let (progress, partial) = {
            let mut download = self.download.lock();
            if download.url_response.is_none()
                && let Some(resumable) = download.resumable.take()
                && ResumableData::is_resumed_response(&response)
            {
                download.resumed_len = resumable.data.len() as u64;
                download.data = BytesMut::from(&resumable.data[..]);
            }
            download.data.extend_from_slice(&chunk);

            let completed = download.data.len() as u64;
            let total = response
                .expected_content_length
                .map_or(0, |expected| expected + download.resumed_len);
            let partial = (completed < total).then(|| Bytes::copy_from_slice(&download.data));
            download.url_response = Some(response.clone());
            (TaskProgress::new(completed, total), partial)
        };

        trace!(
            url = %self.request.url(),
            completed = progress.completed,
            total = progress.total,
            "Received data"
        );
        self.task.send_progress(progress);
        if let Some(data) = partial {
            self.task.send_value(
                ImageData {
                    data,
                    response: Some(response),
                },
                false,
            );
        }
    }

    fn did_finish(&self, result: Result<(), LoadError>) {
        if self.task.is_disposed() {
            return;
        }
        if let Err(error) = result {
            debug!(url = %self.request.url(), error = %error, "Data loading failed");
            self.try_to_save_resumable_data();
            self.task.send_error(PipelineError::data_loading_failed(error));
            return;
        }

        let (data, response) = {
            let mut download = self.download.lock();
            (
                std::mem::take(&mut download.data).freeze(),
                download.url_response.clone(),
            )
        };
        if data.is_empty() {
            self.task
                .send_error(PipelineError::data_loading_failed(LoadError::EmptyResponse));
            return;
        }

        if let Some(cache) = self
            .pipeline
            .config
            .data_cache_for(DataCacheItem::OriginalImageData)
        {
            cache.store_data(data.clone(), &self.request.cache_key_for_original_image_data());
        }
        self.task.send_value(ImageData { data, response }, true);
    }

    fn try_to_save_resumable_data(&self) {
        if !self.pipeline.config.settings.is_resumable_data_enabled {
            return;
        }
        let download = self.download.lock();
        let Some(response) = &download.url_response else {
            return;
        };
        if download.data.is_empty() {
            return;
        }
        // Judge the whole body, not just the remainder a range response carried.
        let mut response = response.clone();
        response.expected_content_length = response
            .expected_content_length
            .map(|expected| expected + download.resumed_len);
        let data = Bytes::copy_from_slice(&download.data);
        drop(download);

        if let Some(resumable) = ResumableData::new(&response, data) {
            ResumableDataStorage::shared().store_resumable_data(
                resumable,
                &self.request,
                self.pipeline.id(),
            );
        }
    }
}
