use dicom_core::Tag;
use dicom_object::DefaultDicomObject;

/// Small helper trait to pull typed values out of a DICOM object, treating blank values as absent.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;
    fn element_f64s(&self, tag: Tag) -> Option<Vec<f64>>;
    fn element_u32(&self, tag: Tag) -> Option<u32>;
    fn has_element(&self, tag: Tag) -> bool;

    fn element_f64(&self, tag: Tag) -> Option<f64> {
        self.element_f64s(tag).and_then(|v| v.first().copied())
    }
}

impl ElementAccess for DefaultDicomObject {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn element_f64s(&self, tag: Tag) -> Option<Vec<f64>> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .filter(|v| !v.is_empty())
    }

    fn element_u32(&self, tag: Tag) -> Option<u32> {
        self.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}
