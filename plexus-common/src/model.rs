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

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use plexus_api_grpc::proto::plexus::common as common_proto;
use plexus_api_grpc::proto::plexus::peer::v1 as peer_proto;
use plexus_api_grpc::proto::plexus::workflow::v1 as workflow_proto;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[macro_export]
macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map($name)
                    .map_err(|err| format!("Invalid {}: {err}", stringify!($name)))
            }
        }
    };
}

newtype_uuid!(WorkflowId);
newtype_uuid!(SessionId);
newtype_uuid!(ComponentId);
newtype_uuid!(ReservationId);

impl From<WorkflowId> for workflow_proto::WorkflowId {
    fn from(value: WorkflowId) -> Self {
        Self {
            value: value.to_string(),
        }
    }
}

impl TryFrom<workflow_proto::WorkflowId> for WorkflowId {
    type Error = String;

    fn try_from(value: workflow_proto::WorkflowId) -> Result<Self, Self::Error> {
        WorkflowId::from_str(&value.value)
    }
}

/// Identifier of a control-plane node in the peer mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique within one workflow; chosen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn generate() -> Self {
        Self(format!("obj.{}", Uuid::new_v4()))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Json,
    Go,
    Ocaml,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Json => "json",
            Language::Go => "go",
            Language::Ocaml => "ocaml",
            Language::Unknown => "unknown",
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "json" => Ok(Language::Json),
            "go" => Ok(Language::Go),
            "ocaml" => Ok(Language::Ocaml),
            "unknown" => Ok(Language::Unknown),
            other => Err(format!("Invalid language: {other}")),
        }
    }
}

impl From<Language> for common_proto::Language {
    fn from(value: Language) -> Self {
        match value {
            Language::Python => common_proto::Language::Python,
            Language::Json => common_proto::Language::Json,
            Language::Go => common_proto::Language::Go,
            Language::Ocaml => common_proto::Language::Ocaml,
            Language::Unknown => common_proto::Language::Unknown,
        }
    }
}

impl From<common_proto::Language> for Language {
    fn from(value: common_proto::Language) -> Self {
        match value {
            common_proto::Language::Python => Language::Python,
            common_proto::Language::Json => Language::Json,
            common_proto::Language::Go => Language::Go,
            common_proto::Language::Ocaml => Language::Ocaml,
            common_proto::Language::Unknown => Language::Unknown,
        }
    }
}

impl Language {
    pub fn from_proto_i32(value: i32) -> Language {
        common_proto::Language::try_from(value)
            .map(Language::from)
            .unwrap_or(Language::Unknown)
    }

    pub fn to_proto_i32(self) -> i32 {
        common_proto::Language::from(self) as i32
    }
}

/// Pointer into the content-addressed object store. The source hint lets a
/// remote reader fetch from the origin peer when the local store does not
/// hold the object yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub source: Option<PeerId>,
}

impl ObjectRef {
    pub fn local(id: ObjectId) -> Self {
        Self { id, source: None }
    }

    pub fn new(id: ObjectId, source: PeerId) -> Self {
        Self {
            id,
            source: Some(source),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}@{}", self.id, source),
            None => write!(f, "{}", self.id),
        }
    }
}

impl From<ObjectRef> for common_proto::ObjectRef {
    fn from(value: ObjectRef) -> Self {
        Self {
            id: value.id.0,
            source: value.source.map(|s| s.0).unwrap_or_default(),
        }
    }
}

impl TryFrom<common_proto::ObjectRef> for ObjectRef {
    type Error = String;

    fn try_from(value: common_proto::ObjectRef) -> Result<Self, Self::Error> {
        if value.id.is_empty() {
            return Err("Missing object id".to_string());
        }
        Ok(Self {
            id: ObjectId(value.id),
            source: if value.source.is_empty() {
                None
            } else {
                Some(PeerId(value.source))
            },
        })
    }
}

/// An object payload together with its encoding metadata. The id is absent
/// until the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue {
    pub id: Option<ObjectId>,
    pub language: Language,
    pub data: Bytes,
    pub is_stream: bool,
    pub source: Option<PeerId>,
}

impl EncodedValue {
    pub fn new(language: Language, data: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            language,
            data: data.into(),
            is_stream: false,
            source: None,
        }
    }
}

impl From<EncodedValue> for common_proto::EncodedObject {
    fn from(value: EncodedValue) -> Self {
        Self {
            id: value.id.map(|id| id.0).unwrap_or_default(),
            data: value.data.to_vec(),
            language: value.language.to_proto_i32(),
            is_stream: value.is_stream,
            source: value.source.map(|s| s.0).unwrap_or_default(),
        }
    }
}

impl From<common_proto::EncodedObject> for EncodedValue {
    fn from(value: common_proto::EncodedObject) -> Self {
        Self {
            id: if value.id.is_empty() {
                None
            } else {
                Some(ObjectId(value.id))
            },
            language: Language::from_proto_i32(value.language),
            data: Bytes::from(value.data),
            is_stream: value.is_stream,
            source: if value.source.is_empty() {
                None
            } else {
                Some(PeerId(value.source))
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub object_id: ObjectId,
    pub offset: u64,
    pub data: Bytes,
    pub end_of_stream: bool,
}

impl From<StreamChunk> for common_proto::StreamChunk {
    fn from(value: StreamChunk) -> Self {
        Self {
            object_id: value.object_id.0,
            offset: value.offset,
            data: value.data.to_vec(),
            end_of_stream: value.end_of_stream,
        }
    }
}

impl TryFrom<common_proto::StreamChunk> for StreamChunk {
    type Error = String;

    fn try_from(value: common_proto::StreamChunk) -> Result<Self, Self::Error> {
        if value.object_id.is_empty() {
            return Err("Missing object id on stream chunk".to_string());
        }
        Ok(Self {
            object_id: ObjectId(value.object_id),
            offset: value.offset,
            data: Bytes::from(value.data),
            end_of_stream: value.end_of_stream,
        })
    }
}

/// Requested or available amounts of compute. CPU is millicpu, memory and
/// GPU are integer quantities; hardware tags match all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub millicpu: i64,
    pub memory_bytes: i64,
    pub gpus: i32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Resources {
    pub fn new(millicpu: i64, memory_bytes: i64, gpus: i32) -> Self {
        Self {
            millicpu,
            memory_bytes,
            gpus,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I: IntoIterator<Item = String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn fits_within(&self, available: &Resources) -> bool {
        self.millicpu <= available.millicpu
            && self.memory_bytes <= available.memory_bytes
            && self.gpus <= available.gpus
    }

    /// Tag coverage: every tag the request names must be declared by the
    /// provider.
    pub fn covers_tags(&self, request: &Resources) -> bool {
        request.tags.is_subset(&self.tags)
    }

    pub fn plus(&self, other: &Resources) -> Resources {
        Resources {
            millicpu: self.millicpu.saturating_add(other.millicpu),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            gpus: self.gpus.saturating_add(other.gpus),
            tags: self.tags.clone(),
        }
    }

    pub fn minus(&self, other: &Resources) -> Resources {
        Resources {
            millicpu: self.millicpu.saturating_sub(other.millicpu),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            gpus: self.gpus.saturating_sub(other.gpus),
            tags: self.tags.clone(),
        }
    }

    /// Fraction of this capacity still free given `allocated`, the minimum
    /// across dimensions with non-zero capacity. 1.0 for an empty provider,
    /// 0.0 when any dimension is exhausted.
    pub fn headroom_ratio(&self, allocated: &Resources) -> f64 {
        let mut ratio = f64::INFINITY;
        if self.millicpu > 0 {
            ratio = ratio
                .min((self.millicpu - allocated.millicpu).max(0) as f64 / self.millicpu as f64);
        }
        if self.memory_bytes > 0 {
            ratio = ratio.min(
                (self.memory_bytes - allocated.memory_bytes).max(0) as f64
                    / self.memory_bytes as f64,
            );
        }
        if self.gpus > 0 {
            ratio = ratio.min((self.gpus - allocated.gpus).max(0) as f64 / self.gpus as f64);
        }
        if ratio.is_infinite() {
            1.0
        } else {
            ratio
        }
    }
}

impl Display for Resources {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}m cpu, {} bytes, {} gpus",
            self.millicpu, self.memory_bytes, self.gpus
        )?;
        if !self.tags.is_empty() {
            write!(f, " [{}]", self.tags.iter().cloned().collect::<Vec<_>>().join(","))?;
        }
        Ok(())
    }
}

impl From<Resources> for common_proto::Resources {
    fn from(value: Resources) -> Self {
        Self {
            millicpu: value.millicpu,
            memory_bytes: value.memory_bytes,
            gpus: value.gpus,
            tags: value.tags.into_iter().collect(),
        }
    }
}

impl From<common_proto::Resources> for Resources {
    fn from(value: common_proto::Resources) -> Self {
        Self {
            millicpu: value.millicpu,
            memory_bytes: value.memory_bytes,
            gpus: value.gpus,
            tags: value.tags.into_iter().collect(),
        }
    }
}

/// Stable hash identifying interchangeable function specs: two specs with
/// the same fingerprint can share warm components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionFingerprint(pub String);

impl Display for FunctionFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    pub language: Language,
    pub body: Bytes,
    pub requirements: Vec<String>,
    pub resources: Resources,
    pub replicas: u32,
    pub venv: Option<String>,
    pub timeout: Option<Duration>,
}

impl FunctionSpec {
    /// Hash over (language, body, requirements, venv). Name, resources and
    /// replica count deliberately do not participate: they do not change
    /// what a warmed sandbox can execute.
    pub fn fingerprint(&self) -> FunctionFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.language.as_str().as_bytes());
        hasher.update(&(self.body.len() as u64).to_le_bytes());
        hasher.update(&self.body);
        for requirement in &self.requirements {
            hasher.update(&(requirement.len() as u64).to_le_bytes());
            hasher.update(requirement.as_bytes());
        }
        if let Some(venv) = &self.venv {
            hasher.update(venv.as_bytes());
        }
        FunctionFingerprint(hasher.finalize().to_hex().to_string())
    }
}

impl From<FunctionSpec> for workflow_proto::FunctionDef {
    fn from(value: FunctionSpec) -> Self {
        Self {
            name: value.name,
            language: value.language.to_proto_i32(),
            pickled_body: value.body.to_vec(),
            requirements: value.requirements,
            resources: Some(value.resources.into()),
            replicas: value.replicas as i32,
            venv: value.venv.unwrap_or_default(),
            timeout_ms: value.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
        }
    }
}

impl TryFrom<workflow_proto::FunctionDef> for FunctionSpec {
    type Error = String;

    fn try_from(value: workflow_proto::FunctionDef) -> Result<Self, Self::Error> {
        if value.name.is_empty() {
            return Err("Missing function name".to_string());
        }
        Ok(Self {
            name: value.name,
            language: Language::from_proto_i32(value.language),
            body: Bytes::from(value.pickled_body),
            requirements: value.requirements,
            resources: value.resources.map(Resources::from).unwrap_or_default(),
            replicas: value.replicas.max(0) as u32,
            venv: if value.venv.is_empty() {
                None
            } else {
                Some(value.venv)
            },
            timeout: if value.timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(value.timeout_ms))
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ContainerHost,
    Cluster,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::ContainerHost => "container-host",
            ProviderKind::Cluster => "cluster",
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container-host" => Ok(ProviderKind::ContainerHost),
            "cluster" => Ok(ProviderKind::Cluster),
            other => Err(format!("Invalid provider kind: {other}")),
        }
    }
}

impl From<ProviderKind> for peer_proto::ProviderKind {
    fn from(value: ProviderKind) -> Self {
        match value {
            ProviderKind::ContainerHost => peer_proto::ProviderKind::ContainerHost,
            ProviderKind::Cluster => peer_proto::ProviderKind::Cluster,
        }
    }
}

impl TryFrom<peer_proto::ProviderKind> for ProviderKind {
    type Error = String;

    fn try_from(value: peer_proto::ProviderKind) -> Result<Self, Self::Error> {
        match value {
            peer_proto::ProviderKind::ContainerHost => Ok(ProviderKind::ContainerHost),
            peer_proto::ProviderKind::Cluster => Ok(ProviderKind::Cluster),
            peer_proto::ProviderKind::Unspecified => {
                Err("Unspecified provider kind".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Dispatched,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Dispatched => "dispatched",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl From<TaskState> for workflow_proto::TaskState {
    fn from(value: TaskState) -> Self {
        match value {
            TaskState::Pending => workflow_proto::TaskState::Pending,
            TaskState::Ready => workflow_proto::TaskState::Ready,
            TaskState::Dispatched => workflow_proto::TaskState::Dispatched,
            TaskState::Succeeded => workflow_proto::TaskState::Succeeded,
            TaskState::Failed => workflow_proto::TaskState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<WorkflowState> for workflow_proto::WorkflowState {
    fn from(value: WorkflowState) -> Self {
        match value {
            WorkflowState::Running => workflow_proto::WorkflowState::Running,
            WorkflowState::Succeeded => workflow_proto::WorkflowState::Succeeded,
            WorkflowState::Failed => workflow_proto::WorkflowState::Failed,
            WorkflowState::Cancelled => workflow_proto::WorkflowState::Cancelled,
        }
    }
}

/// Closed set of error categories surfaced to callers, always as tag plus
/// message, never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NoCapacity,
    ColdStartFailed,
    WorkerCrashed,
    Timeout,
    Cancelled,
    PeerUnreachable,
    UpstreamFailed,
    NotFound,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NoCapacity => "no_capacity",
            ErrorKind::ColdStartFailed => "cold_start_failed",
            ErrorKind::WorkerCrashed => "worker_crashed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::PeerUnreachable => "peer_unreachable",
            ErrorKind::UpstreamFailed => "upstream_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Fatal => "fatal",
        }
    }

    /// Transient kinds are retried by the workflow executor with backoff
    /// until the attempt budget runs out.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoCapacity
                | ErrorKind::ColdStartFailed
                | ErrorKind::WorkerCrashed
                | ErrorKind::PeerUnreachable
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn fingerprint_ignores_name_and_resources() {
        let base = FunctionSpec {
            name: "summarize".to_string(),
            language: Language::Python,
            body: Bytes::from_static(b"\x80\x05body"),
            requirements: vec!["numpy".to_string()],
            resources: Resources::new(500, 128 << 20, 0),
            replicas: 1,
            venv: None,
            timeout: None,
        };
        let mut renamed = base.clone();
        renamed.name = "aggregate".to_string();
        renamed.resources = Resources::new(2000, 1 << 30, 1);
        renamed.replicas = 4;
        assert_eq!(base.fingerprint(), renamed.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_body_requirements_and_venv() {
        let base = FunctionSpec {
            name: "summarize".to_string(),
            language: Language::Python,
            body: Bytes::from_static(b"\x80\x05body"),
            requirements: vec!["numpy".to_string()],
            resources: Resources::default(),
            replicas: 1,
            venv: None,
            timeout: None,
        };
        let mut other_body = base.clone();
        other_body.body = Bytes::from_static(b"\x80\x05other");
        assert_ne!(base.fingerprint(), other_body.fingerprint());

        let mut other_reqs = base.clone();
        other_reqs.requirements = vec!["numpy".to_string(), "pandas".to_string()];
        assert_ne!(base.fingerprint(), other_reqs.fingerprint());

        let mut other_venv = base.clone();
        other_venv.venv = Some("ml".to_string());
        assert_ne!(base.fingerprint(), other_venv.fingerprint());
    }

    #[test]
    fn headroom_ratio_is_min_across_dimensions() {
        let capacity = Resources::new(1000, 1000, 2);
        let allocated = Resources::new(500, 900, 0);
        let ratio = capacity.headroom_ratio(&allocated);
        assert!((ratio - 0.1).abs() < 1e-9);

        let empty = Resources::new(1000, 1000, 0);
        assert_eq!(empty.headroom_ratio(&Resources::default()), 1.0);
    }

    #[test]
    fn tag_match_is_all_or_nothing() {
        let provider = Resources::new(1000, 1000, 0)
            .with_tags(vec!["gpu".to_string(), "avx512".to_string()]);
        let subset = Resources::new(1, 1, 0).with_tags(vec!["gpu".to_string()]);
        let disjoint = Resources::new(1, 1, 0).with_tags(vec!["tpu".to_string()]);
        assert!(provider.covers_tags(&subset));
        assert!(!provider.covers_tags(&disjoint));
    }

    #[test]
    fn object_ref_proto_roundtrip_preserves_empty_source() {
        let without_source = ObjectRef::local(ObjectId::generate());
        let proto: common_proto::ObjectRef = without_source.clone().into();
        assert_eq!(proto.source, "");
        assert_eq!(ObjectRef::try_from(proto).unwrap(), without_source);

        let with_source = ObjectRef::new(ObjectId::generate(), PeerId::new("peer-a"));
        let proto: common_proto::ObjectRef = with_source.clone().into();
        assert_eq!(ObjectRef::try_from(proto).unwrap(), with_source);
    }
}
