//! 后端注册表 (Backend registry)
//!
//! Name → factory maps for detector and depth backends, plus the
//! process-wide singletons built from them on first use.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use tracing::info;

use super::{DepthEstimator, DetectionBackend, Detector};
use crate::config::{DepthSettings, DetectorSettings};
use crate::error::{AnalyzerError, Result};

/// 检测后端工厂: (配置, 可选模型路径覆盖) → 后端
pub type DetectorFactory = Arc<
    dyn Fn(&DetectorSettings, Option<&Path>) -> anyhow::Result<Box<dyn DetectionBackend>>
        + Send
        + Sync,
>;

/// 深度后端工厂: (配置, 可选缓存目录覆盖) → 后端
pub type DepthFactory = Arc<
    dyn Fn(&DepthSettings, Option<&Path>) -> anyhow::Result<Box<dyn DepthEstimator>> + Send + Sync,
>;

/// 进程级共享的深度估计器
pub type SharedDepthEstimator = Arc<Mutex<Box<dyn DepthEstimator>>>;

// ========== 全局状态 ==========

static DETECTOR_BACKENDS: Lazy<RwLock<HashMap<String, DetectorFactory>>> =
    Lazy::new(|| RwLock::new(builtin_detector_backends()));

static DEPTH_BACKENDS: Lazy<RwLock<HashMap<String, DepthFactory>>> =
    Lazy::new(|| RwLock::new(builtin_depth_backends()));

/// 显式注册的整体工厂, 优先于按名字解析
static DETECTOR_OVERRIDE: Lazy<Mutex<Option<DetectorFactory>>> = Lazy::new(|| Mutex::new(None));
static DEPTH_OVERRIDE: Lazy<Mutex<Option<DepthFactory>>> = Lazy::new(|| Mutex::new(None));

static DETECTOR_INSTANCE: Lazy<Mutex<Option<Arc<Detector>>>> = Lazy::new(|| Mutex::new(None));
static DEPTH_INSTANCE: Lazy<Mutex<Option<SharedDepthEstimator>>> = Lazy::new(|| Mutex::new(None));

#[cfg(feature = "onnx")]
fn builtin_detector_backends() -> HashMap<String, DetectorFactory> {
    let onnx: DetectorFactory = Arc::new(|settings, model_path| {
        let model = super::yolov8::YOLOv8::new(settings, model_path)?;
        Ok(Box::new(model) as Box<dyn DetectionBackend>)
    });
    HashMap::from([("onnx".to_string(), onnx)])
}

#[cfg(not(feature = "onnx"))]
fn builtin_detector_backends() -> HashMap<String, DetectorFactory> {
    HashMap::new()
}

#[cfg(feature = "onnx")]
fn builtin_depth_backends() -> HashMap<String, DepthFactory> {
    let onnx: DepthFactory = Arc::new(|settings, cache_dir| {
        let model = super::midas::MiDaS::new(settings, cache_dir)?;
        Ok(Box::new(model) as Box<dyn DepthEstimator>)
    });
    HashMap::from([("onnx".to_string(), onnx)])
}

#[cfg(not(feature = "onnx"))]
fn builtin_depth_backends() -> HashMap<String, DepthFactory> {
    HashMap::new()
}

fn normalize(role: &'static str, name: &str) -> Result<String> {
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(AnalyzerError::InvalidBackendName { role });
    }
    Ok(normalized)
}

fn sorted_names<F>(map: &RwLock<HashMap<String, F>>) -> Vec<String> {
    let map = map.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

fn lookup<F: Clone>(
    role: &'static str,
    map: &RwLock<HashMap<String, F>>,
    name: &str,
) -> Result<(String, F)> {
    let normalized = normalize(role, name)?;
    let guard = map.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    match guard.get(&normalized) {
        Some(factory) => Ok((normalized, factory.clone())),
        None => {
            let mut known: Vec<&String> = guard.keys().collect();
            known.sort();
            Err(AnalyzerError::unknown_backend(role, &normalized, known))
        }
    }
}

// ========== 检测后端 ==========

/// 按名字注册检测后端 (名字忽略大小写与首尾空白)
pub fn register_detector_backend(name: &str, factory: DetectorFactory) -> Result<()> {
    let name = normalize("detector", name)?;
    DETECTOR_BACKENDS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(name, factory);
    reset_detector();
    Ok(())
}

/// 已注册的检测后端 (排序)
pub fn available_detector_backends() -> Vec<String> {
    sorted_names(&DETECTOR_BACKENDS)
}

/// 替换单例构造方式 (测试中注入假后端), 并丢弃已有实例
pub fn register_detector_factory(factory: DetectorFactory) {
    *DETECTOR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(factory);
    reset_detector();
}

/// 丢弃检测器单例, 下次 `get_detector` 重新构造
pub fn reset_detector() {
    *DETECTOR_INSTANCE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
}

/// 获取检测器单例, 首次调用时构造
///
/// `model_path` 只在首次构造时生效。
pub fn get_detector(settings: &DetectorSettings, model_path: Option<&Path>) -> Result<Arc<Detector>> {
    let mut instance = DETECTOR_INSTANCE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(detector) = instance.as_ref() {
        return Ok(detector.clone());
    }

    let override_factory = DETECTOR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    let (name, factory) = match override_factory {
        Some(factory) => ("custom".to_string(), factory),
        None => lookup("detector", &DETECTOR_BACKENDS, &settings.backend)?,
    };

    info!(backend = %name, "initialising detector backend");
    let backend = factory(settings, model_path).map_err(|source| AnalyzerError::BackendInit {
        role: "detector",
        name: name.clone(),
        source,
    })?;

    let detector = Arc::new(Detector::new(backend));
    *instance = Some(detector.clone());
    Ok(detector)
}

// ========== 深度后端 ==========

pub fn register_depth_backend(name: &str, factory: DepthFactory) -> Result<()> {
    let name = normalize("depth", name)?;
    DEPTH_BACKENDS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(name, factory);
    reset_depth_estimator();
    Ok(())
}

pub fn available_depth_backends() -> Vec<String> {
    sorted_names(&DEPTH_BACKENDS)
}

pub fn register_depth_estimator(factory: DepthFactory) {
    *DEPTH_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(factory);
    reset_depth_estimator();
}

pub fn reset_depth_estimator() {
    *DEPTH_INSTANCE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
}

/// 获取深度估计器单例
///
/// `cache_dir` 覆盖配置中的缓存目录, 只在首次构造时生效。
pub fn get_depth_estimator(
    settings: &DepthSettings,
    cache_dir: Option<&Path>,
) -> Result<SharedDepthEstimator> {
    let mut instance = DEPTH_INSTANCE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(estimator) = instance.as_ref() {
        return Ok(estimator.clone());
    }

    let override_factory = DEPTH_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    let (name, factory) = match override_factory {
        Some(factory) => ("custom".to_string(), factory),
        None => lookup("depth", &DEPTH_BACKENDS, &settings.backend)?,
    };

    info!(backend = %name, model_type = %settings.model_type, "initialising depth backend");
    let estimator = factory(settings, cache_dir).map_err(|source| AnalyzerError::BackendInit {
        role: "depth",
        name: name.clone(),
        source,
    })?;

    let shared: SharedDepthEstimator = Arc::new(Mutex::new(estimator));
    *instance = Some(shared.clone());
    Ok(shared)
}

/// 测试辅助: 清除注入的工厂与单例
#[cfg(test)]
pub(crate) fn clear_overrides() {
    *DETECTOR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    *DEPTH_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    reset_detector();
    reset_depth_estimator();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry_guard, FakeDepth, FakeDetector};

    fn fake_detector_factory() -> DetectorFactory {
        Arc::new(|_, _| Ok(Box::new(FakeDetector::new(Vec::new())) as Box<dyn DetectionBackend>))
    }

    #[test]
    fn test_register_normalises_names() {
        let _guard = registry_guard();
        register_detector_backend("  Fake-Upper ", fake_detector_factory()).unwrap();
        assert!(available_detector_backends().contains(&"fake-upper".to_string()));
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let _guard = registry_guard();
        let err = register_detector_backend("   ", fake_detector_factory()).unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidBackendName { role: "detector" }));
    }

    #[test]
    fn test_available_backends_sorted() {
        let _guard = registry_guard();
        register_depth_backend("zeta", Arc::new(|_, _| Ok(Box::new(FakeDepth::constant(1.0)) as Box<dyn DepthEstimator>)))
            .unwrap();
        register_depth_backend("alpha", Arc::new(|_, _| Ok(Box::new(FakeDepth::constant(1.0)) as Box<dyn DepthEstimator>)))
            .unwrap();
        let names = available_depth_backends();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"alpha".to_string()));
    }

    #[test]
    fn test_unknown_backend_fails_fast() {
        let _guard = registry_guard();
        clear_overrides();
        let settings = DetectorSettings {
            backend: "does-not-exist".to_string(),
            ..DetectorSettings::default()
        };
        match get_detector(&settings, None) {
            Err(AnalyzerError::UnknownBackend { role, name, .. }) => {
                assert_eq!(role, "detector");
                assert_eq!(name, "does-not-exist");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("unknown backend resolved"),
        }
    }

    #[test]
    fn test_singleton_is_memoised_until_reregistered() {
        let _guard = registry_guard();
        clear_overrides();
        register_detector_backend("memo", fake_detector_factory()).unwrap();
        let settings = DetectorSettings {
            backend: "MEMO".to_string(),
            ..DetectorSettings::default()
        };

        let a = get_detector(&settings, None).unwrap();
        let b = get_detector(&settings, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        register_detector_factory(fake_detector_factory());
        let c = get_detector(&settings, None).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        clear_overrides();
    }

    #[test]
    fn test_factory_failure_is_backend_init_error() {
        let _guard = registry_guard();
        clear_overrides();
        register_depth_estimator(Arc::new(|_, _| Err(anyhow::anyhow!("weights missing"))));
        let err = get_depth_estimator(&DepthSettings::default(), None)
            .err()
            .expect("factory error");
        assert!(matches!(err, AnalyzerError::BackendInit { role: "depth", .. }));
        assert!(err.to_string().contains("weights missing"));
        clear_overrides();
    }

    #[test]
    fn test_depth_singleton_uses_override() {
        let _guard = registry_guard();
        clear_overrides();
        register_depth_estimator(Arc::new(|_, _| {
            Ok(Box::new(FakeDepth::constant(2.5)) as Box<dyn DepthEstimator>)
        }));
        let a = get_depth_estimator(&DepthSettings::default(), None).unwrap();
        let b = get_depth_estimator(&DepthSettings::default(), None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().unwrap().model_type(), "fake");
        clear_overrides();
    }
}
