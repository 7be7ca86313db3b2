// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Access to the remote object store: a random-access reader that turns
//! arbitrary reads into few ranged GETs, and a writer that builds a new object
//! out of a server-side copied prefix plus a locally buffered suffix.

mod memory;
mod reader;
mod retry;
mod s3;
mod traits;
mod writer;

pub use memory::{MemoryStore, StoreCalls};
pub use reader::{RangedRemoteReader, READ_AHEAD_WINDOW};
pub use retry::{RetryConfig, RetryingStore};
pub use s3::{S3Config, S3Store};
pub use traits::{CompletedPart, ObjectMeta, ObjectStore};
pub use writer::{plan_parts, MultipartConfig, MultipartRemoteWriter, UploadPart};
