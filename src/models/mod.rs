pub mod loaders;
pub mod result;
pub mod stage;
pub mod status;
pub mod trace;
pub mod upload;

pub use loaders::{load_all_uploads, load_upload};
pub use result::{
    latest_per_stage, CategorizePayload, DeidentifyPayload, Entity, ExtractPayload,
    IngestPayload, MaskStrategy, ParsePayload, PiiItem, StageMetrics, StageOutput,
    StagePayload, StageResult,
};
pub use stage::{RunState, Stage};
pub use status::{FailureKind, FileProcessingStatus, StageRunState, StatusEvent, StatusVersion};
pub use trace::{Span, SpanKind, SpanStatus, Trace};
pub use upload::UploadedFile;
