/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![allow(unused)]

use myelin::prelude::*;

// a single instrument sample, the workhorse payload of these tests
#[myelin_payload]
pub struct Reading {
    pub station: String,
    pub celsius: f64,
}

#[myelin_payload]
pub struct Job {
    pub id: u64,
    pub task: String,
}

// already derives Clone; the macro fills in the rest
#[myelin_payload]
#[derive(Clone)]
pub struct Answer {
    pub id: u64,
    pub outcome: String,
}
