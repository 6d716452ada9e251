use crate::common::*;
use bbox::XYWH;

/// An image entry of a COCO instances file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// An annotation entry of a COCO instances file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    /// Box in `[x, y, w, h]` layout.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub iscrowd: u8,
}

impl Annotation {
    pub fn rect(&self) -> Result<XYWH<f64>> {
        XYWH::try_from_xywh(self.bbox)
            .with_context(|| format!("invalid bbox in annotation {}", self.id))
    }

    /// The area used for area-range filtering. Falls back to the box area
    /// when the annotation carries none.
    pub fn area(&self) -> f64 {
        let [_, _, w, h] = self.bbox;
        self.area.unwrap_or(w * h)
    }

    pub fn is_crowd(&self) -> bool {
        self.iscrowd != 0
    }
}

#[derive(Debug, Clone, Deserialize)]
struct InstancesFile {
    images: Vec<Image>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

/// One detection to be scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub image_id: u64,
    pub category_id: u64,
    /// Box in `[x, y, w, h]` layout.
    pub bbox: [f64; 4],
    pub score: f64,
}

/// Ground truth of a COCO instances file, indexed by image id.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    images: IndexMap<u64, Image>,
    annotations: HashMap<u64, Vec<Annotation>>,
}

impl GroundTruth {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read annotation file '{}'", path.display()))?;
        let InstancesFile {
            images,
            annotations,
        } = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse annotation file '{}'", path.display()))?;
        let gt = Self::new(images, annotations)?;
        info!(
            "loaded {} images and {} annotations from '{}'",
            gt.images.len(),
            gt.num_annotations(),
            path.display()
        );
        Ok(gt)
    }

    pub fn new(images: Vec<Image>, annotations: Vec<Annotation>) -> Result<Self> {
        let mut image_map = IndexMap::new();
        for image in images {
            let id = image.id;
            ensure!(
                image_map.insert(id, image).is_none(),
                "duplicated image id {}",
                id
            );
        }
        image_map.sort_keys();

        let mut annotation_map: HashMap<u64, Vec<Annotation>> = HashMap::new();
        for ann in annotations {
            ensure!(
                image_map.contains_key(&ann.image_id),
                "annotation {} refers to unknown image {}",
                ann.id,
                ann.image_id
            );
            ann.rect()?;
            annotation_map.entry(ann.image_id).or_default().push(ann);
        }

        Ok(Self {
            images: image_map,
            annotations: annotation_map,
        })
    }

    /// Image ids in ascending order.
    pub fn image_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.images.keys().copied()
    }

    pub fn annotations(&self, image_id: u64) -> &[Annotation] {
        self.annotations
            .get(&image_id)
            .map(|anns| anns.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_annotations(&self) -> usize {
        self.annotations.values().map(|anns| anns.len()).sum()
    }

    /// Check detections against the image set and group them by image.
    ///
    /// Detections must refer to known images.
    pub fn load_results(&self, detections: Vec<Detection>) -> Result<HashMap<u64, Vec<Detection>>> {
        let mut grouped: HashMap<u64, Vec<Detection>> = HashMap::new();
        for det in detections {
            ensure!(
                self.images.contains_key(&det.image_id),
                "detection refers to image {} which is not in the ground truth",
                det.image_id
            );
            ensure!(det.score.is_finite(), "non-finite detection score");
            grouped.entry(det.image_id).or_default().push(det);
        }
        Ok(grouped)
    }
}
