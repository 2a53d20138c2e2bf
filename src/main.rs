// Copyright 2023 Google LLC
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

/// codewire is a local session-multiplexer node: it owns long-running
/// child processes bound to pseudo-terminals and exposes them to many
/// concurrent clients over a framed unix socket protocol.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = codewire::Args::parse();

    if args.version() {
        println!("codewire {}", VERSION);
        return Ok(());
    }

    codewire::run(args, None)
}
