//! Operator-facing status overview.

use std::fmt;

use serde::Serialize;
use storyloom_core::plan::{AssetKind, EntityKey, PipelineDocument, PlanBody};
use storyloom_core::status::{Status, ALL_STATUSES};

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub id: String,
    pub status: Status,
}

/// Status of every entity in one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub name: String,
    pub entries: Vec<EntryStatus>,
}

impl CollectionSummary {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, id: impl Into<String>, status: Status) {
        self.entries.push(EntryStatus {
            id: id.into(),
            status,
        });
    }

    /// Non-zero counts in status order.
    pub fn counts(&self) -> Vec<(Status, usize)> {
        ALL_STATUSES
            .into_iter()
            .map(|s| (s, self.entries.iter().filter(|e| e.status == s).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub project: String,
    pub version: u8,
    pub collections: Vec<CollectionSummary>,
}

impl StatusSummary {
    pub fn from_document(doc: &PipelineDocument) -> Self {
        let mut collections = Vec::new();

        for kind in AssetKind::ALL {
            let section = doc.assets.section(kind);
            if section.is_empty() {
                continue;
            }
            let mut summary = CollectionSummary::new(kind.section());
            for (id, asset) in section {
                summary.push(id.as_str(), asset.status);
            }
            collections.push(summary);
        }

        let mut keyframes = CollectionSummary::new("keyframes");
        match &doc.body {
            PlanBody::Legacy { keyframes: list, videos } => {
                for kf in list {
                    keyframes.push(kf.id.clone().unwrap_or_default(), kf.status);
                }
                collections.push(keyframes);

                let mut summary = CollectionSummary::new("videos");
                for video in videos {
                    summary.push(video.id.clone().unwrap_or_default(), video.status);
                }
                collections.push(summary);
            }
            PlanBody::Scenes { .. } | PlanBody::Segmented { .. } => {
                if let Some(kf) = doc.keyframe(&EntityKey::FirstKeyframe) {
                    keyframes.push(EntityKey::FirstKeyframe.to_string(), kf.status);
                }
                for scene in doc.scenes() {
                    if let Some(kf) = &scene.first_keyframe {
                        keyframes.push(scene.id(), kf.status);
                    }
                }
                if !keyframes.entries.is_empty() {
                    collections.push(keyframes);
                }

                let mut scenes = CollectionSummary::new("scenes");
                let mut segments = CollectionSummary::new("segments");
                for (index, scene) in doc.scenes().iter().enumerate() {
                    scenes.push(scene.id(), doc.scene_status(index).unwrap_or_default());
                    for segment in &scene.segments {
                        let id = segment.id.as_deref().unwrap_or_default();
                        segments.push(format!("{}/{id}", scene.id()), segment.status);
                    }
                }
                collections.push(scenes);
                if !segments.entries.is_empty() {
                    collections.push(segments);
                }
            }
        }

        if let Some(final_video) = doc.final_video() {
            let mut summary = CollectionSummary::new("final_video");
            summary.push("final_video", final_video.status);
            collections.push(summary);
        }

        Self {
            project: doc.project_name().to_string(),
            version: doc.version().number(),
            collections,
        }
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (v{})", self.project, self.version)?;
        for collection in &self.collections {
            let counts: Vec<String> = collection
                .counts()
                .into_iter()
                .map(|(status, n)| format!("{n} {status}"))
                .collect();
            write!(f, "\n\n{}: {}", collection.name, counts.join(", "))?;
            for entry in &collection.entries {
                write!(f, "\n  {} {}", entry.status.icon(), entry.id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn v3_summary_counts_derived_scenes_and_segments() {
        let doc = PipelineDocument::from_value(json!({
            "project_name": "demo",
            "assets": {"characters": {"hero": {"prompt": "p", "output": "h.png", "status": "approved"}}},
            "scenes": [
                {"id": "A", "output_video": "a.mp4",
                 "first_keyframe": {"type": "generated", "prompt": "p", "output": "a.png", "status": "generated"},
                 "segments": [
                    {"id": "A1", "output_video": "a1.mp4", "output_keyframe": "a1.png", "status": "generated"},
                    {"id": "A2", "output_video": "a2.mp4", "status": "failed"}
                 ]}
            ],
            "final_video": {"output": "final.mp4"}
        }))
        .unwrap();

        let summary = StatusSummary::from_document(&doc);
        let names: Vec<&str> = summary.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["characters", "keyframes", "scenes", "segments", "final_video"]);
        assert_eq!(summary.collections[2].entries[0].status, Status::Failed);
        assert_eq!(
            summary.collections[3].counts(),
            [(Status::Generated, 1), (Status::Failed, 1)]
        );

        let text = summary.to_string();
        assert!(text.starts_with("demo (v3)"));
        assert!(text.contains("characters: 1 approved\n  + hero"));
        assert!(text.contains("  x A/A2"));
    }

    #[test]
    fn v1_summary_lists_keyframes_and_videos() {
        let doc = PipelineDocument::from_value(json!({
            "project_name": "old",
            "keyframes": [{"id": "k1", "prompt": "p", "output": "k1.png"}],
            "videos": [{"id": "v1", "prompt": "p", "start_keyframe": "k1", "output": "v1.mp4"}]
        }))
        .unwrap();

        let summary = StatusSummary::from_document(&doc);
        let names: Vec<&str> = summary.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["keyframes", "videos"]);
        assert!(summary.to_string().contains("videos: 1 pending\n  . v1"));
    }
}
