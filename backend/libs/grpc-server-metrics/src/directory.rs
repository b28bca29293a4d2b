//! Directory of the services and methods a server exposes
//!
//! tonic does not keep a queryable list of registered methods, so the
//! directory is either built explicitly or read from the file descriptor set
//! `tonic-build` emits for reflection.

use std::collections::BTreeMap;

use prost::Message;
use prost_types::FileDescriptorSet;

use crate::error::Result;
use crate::labels::{CallShape, MethodIdentity};

/// One method of a service and its streaming directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, client_streaming: bool, server_streaming: bool) -> Self {
        Self {
            name: name.into(),
            client_streaming,
            server_streaming,
        }
    }

    pub fn unary(name: impl Into<String>) -> Self {
        Self::new(name, false, false)
    }

    pub fn client_stream(name: impl Into<String>) -> Self {
        Self::new(name, true, false)
    }

    pub fn server_stream(name: impl Into<String>) -> Self {
        Self::new(name, false, true)
    }

    pub fn bidi_stream(name: impl Into<String>) -> Self {
        Self::new(name, true, true)
    }

    pub fn shape(&self) -> CallShape {
        CallShape::from_streaming(self.client_streaming, self.server_streaming)
    }
}

/// Fully qualified service name -> methods
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDirectory {
    services: BTreeMap<String, Vec<MethodInfo>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_service`](Self::add_service)
    pub fn with_service(
        mut self,
        service: impl Into<String>,
        methods: impl IntoIterator<Item = MethodInfo>,
    ) -> Self {
        self.add_service(service, methods);
        self
    }

    /// Add methods to a service; a method already listed is replaced
    pub fn add_service(
        &mut self,
        service: impl Into<String>,
        methods: impl IntoIterator<Item = MethodInfo>,
    ) {
        let entry = self.services.entry(service.into()).or_default();
        for method in methods {
            match entry.iter_mut().find(|m| m.name == method.name) {
                Some(existing) => *existing = method,
                None => entry.push(method),
            }
        }
    }

    /// Every service declared in a decoded descriptor set
    pub fn from_file_descriptor_set(set: &FileDescriptorSet) -> Self {
        let mut directory = Self::new();
        for file in &set.file {
            for service in &file.service {
                let name = match file.package() {
                    "" => service.name().to_string(),
                    package => format!("{}.{}", package, service.name()),
                };
                let methods = service.method.iter().map(|m| {
                    MethodInfo::new(m.name(), m.client_streaming(), m.server_streaming())
                });
                directory.add_service(name, methods);
            }
        }
        directory
    }

    /// Decode an encoded descriptor set, e.g. the bytes behind
    /// `tonic::include_file_descriptor_set!`
    pub fn from_encoded_file_descriptor_set(bytes: &[u8]) -> Result<Self> {
        let set = FileDescriptorSet::decode(bytes)?;
        Ok(Self::from_file_descriptor_set(&set))
    }

    pub fn services(&self) -> impl Iterator<Item = (&str, &[MethodInfo])> {
        self.services
            .iter()
            .map(|(name, methods)| (name.as_str(), methods.as_slice()))
    }

    pub fn method(&self, identity: &MethodIdentity) -> Option<&MethodInfo> {
        self.services
            .get(&identity.service)?
            .iter()
            .find(|m| m.name == identity.method)
    }

    pub fn shape_of(&self, identity: &MethodIdentity) -> Option<CallShape> {
        self.method(identity).map(MethodInfo::shape)
    }

    pub fn method_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.method_count() == 0
    }
}
