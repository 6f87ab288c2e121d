//! Detection results as they travel over the wire.
//!
use serde::{Deserialize, Serialize};

/// One object found in a frame.
///
/// The bounding box is `[x, y, width, height]` in pixels of the image that was sent for
/// detection, with the origin in the top left corner.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub class: String,
    pub bbox: [f32; 4],
    pub score: f32,
}

impl Detection {
    pub fn new(class: impl Into<String>, bbox: [f32; 4], score: f32) -> Self {
        Self {
            class: class.into(),
            bbox,
            score,
        }
    }

    pub fn label(&self) -> &str {
        &self.class
    }

    /// Bounding box as `(x, y, width, height)`.
    pub fn bounding_box(&self) -> (f32, f32, f32, f32) {
        let [x, y, w, h] = self.bbox;
        (x, y, w, h)
    }

    pub fn confidence(&self) -> f32 {
        self.score
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_wire_field_names() -> Result<(), Error> {
        let detection = Detection::new("person", [5.0, 3.0, 40.0, 20.0], 0.9);

        let json = serde_json::to_value(&detection)?;
        assert_eq!(json["class"], "person");
        assert_eq!(json["bbox"][2], 40.0);
        assert!(json.get("label").is_none());

        let parsed: Detection =
            serde_json::from_str(r#"{"class":"dog","bbox":[1,2,3,4],"score":0.75}"#)?;
        assert_eq!(parsed.label(), "dog");
        assert_eq!(parsed.bounding_box(), (1.0, 2.0, 3.0, 4.0));
        assert_eq!(parsed.confidence(), 0.75);

        Ok(())
    }
}
