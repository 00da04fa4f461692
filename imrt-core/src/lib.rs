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

//! Small dependency-free helpers shared by `imrt-runtime`: lock newtypes, a
//! non-cloneable marker, a lazily-initialized singleton helper, and a boxed
//! error/result alias used by glue code that doesn't want to depend on the
//! runtime's own [`thiserror`]-derived error enum.

pub mod locks;
pub mod noncopyable;
pub mod result;
pub mod singleton;

pub use locks::*;
pub use noncopyable::Noncopyable;
pub use result::{CoreError, CoreResult};
pub use singleton::Singleton;
