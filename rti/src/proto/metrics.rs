//! Measure definitions and measurement samples (`rti/measures`, `rti/measurement`)

/// A named metric definition
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Measure {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub application: String,
    #[prost(string, tag = "3")]
    pub title: String,
    #[prost(string, tag = "4")]
    pub unit: String,
    /// Target channel override; empty means `rti/measurement`
    #[prost(string, tag = "5")]
    pub channel: String,
    /// Aggregation interval in seconds; 0 publishes every sample immediately
    #[prost(double, tag = "6")]
    pub interval: f64,
    /// Samples are keyed per entity as well as per measure
    #[prost(bool, tag = "7")]
    pub entity: bool,
}

impl Measure {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: f64) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn per_entity(mut self) -> Self {
        self.entity = true;
        self
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Measures {
    #[prost(oneof = "measures::Which", tags = "1, 2")]
    pub which: Option<measures::Which>,
}

pub mod measures {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Which {
        #[prost(message, tag = "1")]
        RequestMeasures(super::super::Empty),
        #[prost(message, tag = "2")]
        Measure(super::Measure),
    }
}

impl Measures {
    pub fn of(which: measures::Which) -> Self {
        Self { which: Some(which) }
    }
}

/// One observed sample, or a tumbling-window summary of several
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Measurement {
    #[prost(string, tag = "1")]
    pub measure_id: String,
    #[prost(string, tag = "2")]
    pub client_id: String,
    #[prost(string, tag = "3")]
    pub entity_id: String,
    #[prost(double, tag = "4")]
    pub value: f64,
    #[prost(message, optional, tag = "5")]
    pub window: Option<measurement::Window>,
}

pub mod measurement {
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Window {
        #[prost(int32, tag = "1")]
        pub count: i32,
        #[prost(double, tag = "2")]
        pub mean: f64,
        #[prost(double, tag = "3")]
        pub min: f64,
        #[prost(double, tag = "4")]
        pub max: f64,
        /// Scaled seconds covered by the window
        #[prost(double, tag = "5")]
        pub duration: f64,
    }
}
