//! Pipeline stages. Each stage is the body of one pooled [`Task`].
//!
//! Stage methods only ever run on the pipeline's serial queue. A stage keeps
//! itself alive through its task's hooks and dependency until the task is
//! disposed.
//!
//! [`Task`]: crate::task::Task

mod decode;
mod load_image;
mod load_image_data;
mod process;

pub(crate) use decode::DecodeImage;
pub(crate) use load_image::LoadImage;
pub(crate) use load_image_data::LoadImageData;
pub(crate) use process::ProcessImage;
