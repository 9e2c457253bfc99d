use std::{collections::HashMap, sync::Arc};
use eip_adapter::{SinkAdapter, SourceAdapter};

use crate::endpoint::{Filter, Reducer, ServiceActivator, Splitter, Transformer};

/// Named entries of one handler type.
pub struct Named<T> {
    entries: HashMap<String, T>,
}

impl<T: Clone> Named<T> {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.entries.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.entries.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Handlers that flow files refer to with `ref: <name>`. Built-in endpoints
/// need no registration.
pub struct HandlerRegistry {
    pub transformers: Named<Transformer>,
    pub filters: Named<Filter>,
    pub splitters: Named<Splitter>,
    pub services: Named<ServiceActivator>,
    pub reducers: Named<Reducer>,
    pub sources: Named<Arc<dyn SourceAdapter>>,
    pub sinks: Named<Arc<dyn SinkAdapter>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            transformers: Named::new(),
            filters: Named::new(),
            splitters: Named::new(),
            services: Named::new(),
            reducers: Named::new(),
            sources: Named::new(),
            sinks: Named::new(),
        }
    }

    pub fn with_transformer(mut self, name: impl Into<String>, t: Transformer) -> Self {
        self.transformers.add(name, t);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, f: Filter) -> Self {
        self.filters.add(name, f);
        self
    }

    pub fn with_splitter(mut self, name: impl Into<String>, s: Splitter) -> Self {
        self.splitters.add(name, s);
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, s: ServiceActivator) -> Self {
        self.services.add(name, s);
        self
    }

    pub fn with_reducer(mut self, name: impl Into<String>, r: Reducer) -> Self {
        self.reducers.add(name, r);
        self
    }

    pub fn with_source(mut self, name: impl Into<String>, s: Arc<dyn SourceAdapter>) -> Self {
        self.sources.add(name, s);
        self
    }

    pub fn with_sink(mut self, name: impl Into<String>, s: Arc<dyn SinkAdapter>) -> Self {
        self.sinks.add(name, s);
        self
    }
}
