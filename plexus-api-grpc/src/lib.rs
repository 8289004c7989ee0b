// Copyright 2024-2025 Golem Cloud
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

#[cfg(test)]
test_r::enable!();

pub mod proto {
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("plexus_descriptor");

    pub mod plexus {
        pub mod common {
            tonic::include_proto!("plexus.common");
        }

        pub mod workflow {
            pub mod v1 {
                tonic::include_proto!("plexus.workflow.v1");
            }
        }

        pub mod peer {
            pub mod v1 {
                tonic::include_proto!("plexus.peer.v1");
            }
        }

        pub mod store {
            pub mod v1 {
                tonic::include_proto!("plexus.store.v1");
            }
        }

        pub mod actor {
            tonic::include_proto!("plexus.actor");
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::proto::plexus::actor;
    use prost::Message;

    #[test]
    fn actor_envelope_roundtrip() {
        let msg = actor::Message {
            r#type: actor::MessageType::Ready as i32,
            body: Some(actor::message::Body::Ready(actor::Ready {
                component_id: "b9a4f9f2".to_string(),
            })),
        };
        let bytes = msg.encode_to_vec();
        let decoded = actor::Message::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }
}
