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

use yogi_protocol::EndpointKind;

use crate::{
    endpoint::{Endpoint, EndpointInner},
    path::Path,
    scheduler::Scheduler,
};

/// An endpoint that owns terminals and talks to exactly one peer
/// endpoint. Assigning a second connection fails.
///
/// Cloning yields another handle to the same leaf.
#[derive(Clone)]
pub struct Leaf {
    ep: Endpoint,
}

impl Leaf {
    pub fn new(scheduler: &Scheduler) -> Leaf {
        Leaf {
            ep: Endpoint {
                inner: EndpointInner::create(scheduler, EndpointKind::Leaf, None),
            },
        }
    }

    /// A leaf with a configured location resolves relative terminal
    /// names and binding targets against it.
    pub fn with_location(scheduler: &Scheduler, location: Path) -> Leaf {
        Leaf {
            ep: Endpoint {
                inner: EndpointInner::create(scheduler, EndpointKind::Leaf, Some(location)),
            },
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
    }
}

impl AsRef<Endpoint> for Leaf {
    fn as_ref(&self) -> &Endpoint {
        &self.ep
    }
}
