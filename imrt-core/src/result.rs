/*
 *   Copyright (c) 2026 the imrt authors
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Type alias for glue code that just needs to bubble up *some* error
//! (startup scripts, test helpers) without committing to the runtime's
//! closed [`imrt_runtime::error::RuntimeError`] enum.

use std::error::Error;

pub type CoreError = Box<dyn Error + Send + Sync>;
pub type CoreResult<T> = Result<T, CoreError>;
