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

//! Marker type for embedding in structs that must never implement `Clone` or
//! `Copy`, e.g. `Task` (owns a stack) or `FdContext` (owns a kernel
//! registration). Rust already refuses to derive `Clone`/`Copy` for a struct
//! containing this field, which documents the intent at the type level
//! instead of relying on a comment.

#[derive(Debug, Default)]
pub struct Noncopyable(core::marker::PhantomData<*const ()>);

impl Noncopyable {
    pub const fn new() -> Self { Noncopyable(core::marker::PhantomData) }
}

// `*const ()` is neither `Send` nor `Sync`; types that are meant to cross
// threads (Task, FdContext) assert that explicitly rather than inheriting
// this marker's auto traits.
unsafe impl Send for Noncopyable {}
unsafe impl Sync for Noncopyable {}
