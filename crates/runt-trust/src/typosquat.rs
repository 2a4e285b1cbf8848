//! Look-alike package name detection.
//!
//! Flags dependencies whose names sit a small edit distance from a widely
//! installed PyPI package, e.g. `numppy` for `numpy`.

use serde::{Deserialize, Serialize};
use strsim::levenshtein;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TyposquatWarning {
    /// The dependency as the notebook names it (specifiers stripped).
    pub package: String,
    /// The popular package it is close to.
    pub similar_to: String,
    /// Levenshtein distance between the normalized names.
    pub distance: usize,
}

/// Most downloaded PyPI packages, roughly by rank.
const POPULAR_PACKAGES: &[&str] = &[
    "boto3", "botocore", "urllib3", "requests", "setuptools", "charset-normalizer",
    "certifi", "idna", "typing-extensions", "python-dateutil", "s3transfer", "packaging",
    "aiobotocore", "pyyaml", "numpy", "six", "cryptography", "pip", "jmespath", "s3fs",
    "fsspec", "cffi", "attrs", "pycparser", "wheel", "zipp", "importlib-metadata",
    "aiohttp", "pyasn1", "multidict", "pandas", "platformdirs", "yarl", "rsa", "pytz",
    "google-api-core", "async-timeout", "awscli", "protobuf", "googleapis-common-protos",
    "filelock", "wrapt", "markupsafe", "frozenlist", "colorama", "aiosignal", "click",
    "jinja2", "jsonschema", "tomli", "pyparsing", "pydantic", "grpcio", "pyarrow",
    "sqlalchemy", "tqdm", "docutils", "google-auth", "werkzeug", "pillow", "scipy",
    "decorator", "pluggy", "greenlet", "cachetools", "exceptiongroup", "tzdata", "pytest",
    "iniconfig", "flask", "pyjwt", "google-cloud-storage", "lxml", "pyopenssl", "psutil",
    "oauthlib", "soupsieve", "beautifulsoup4", "google-cloud-core", "requests-oauthlib",
    "httplib2", "pygments", "isodate", "openpyxl", "networkx", "et-xmlfile", "httpx",
    "sniffio", "anyio", "httpcore", "h11", "distlib", "virtualenv",
    // Scientific, ML and data
    "matplotlib", "scikit-learn", "joblib", "threadpoolctl", "tensorflow", "torch",
    "keras", "opencv-python", "transformers", "tokenizers", "huggingface-hub",
    "accelerate", "safetensors", "datasets", "evaluate", "timm", "torchvision",
    "torchaudio", "lightning", "wandb", "mlflow", "ray", "dask", "xarray", "zarr",
    "numba", "cython",
    // Crypto and ssh
    "pynacl", "bcrypt", "paramiko",
    // Web, services and storage
    "selenium", "scrapy", "django", "fastapi", "uvicorn", "gunicorn", "celery", "redis",
    "pymongo", "psycopg2", "mysqlclient", "elasticsearch", "boto", "aws-cdk-lib",
    "starlette", "aiofiles", "python-multipart", "pydantic-settings", "python-dotenv",
    // Tooling and testing
    "black", "flake8", "mypy", "isort", "pylint", "coverage", "nose", "mock", "faker",
    "factory-boy", "hypothesis", "httpretty", "responses", "moto", "rich", "typer",
    // Jupyter
    "ipython", "jupyter", "notebook", "jupyterlab", "ipykernel", "ipywidgets", "nbformat",
    "nbconvert", "traitlets",
    // Serialization
    "orjson", "ujson", "msgpack", "cloudpickle", "dill",
];

/// Bare package name from a requirement string like `pandas[sql]>=2.0`
/// or `torch @ https://...`.
pub fn extract_package_name(spec: &str) -> &str {
    spec.split(['>', '<', '=', '!', '~', '[', ';', '@'])
        .next()
        .unwrap_or(spec)
        .trim()
}

/// PEP 503 style normalization: lowercase, `_` and `.` become `-`.
fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

/// Allowed edit distance grows with name length so short names don't
/// match everything.
fn max_distance(len: usize) -> usize {
    match len {
        0..=3 => 1,
        4..=6 => 2,
        _ => 3,
    }
}

/// Check a single requirement. Returns `None` for exact (normalized)
/// matches of a popular package and for names not close to any.
pub fn check_typosquat(spec: &str) -> Option<TyposquatWarning> {
    let package = extract_package_name(spec);
    let normalized = normalize_name(package);
    if normalized.is_empty() {
        return None;
    }
    let threshold = max_distance(normalized.len());

    let mut best: Option<(&str, usize)> = None;
    for popular in POPULAR_PACKAGES {
        let candidate = normalize_name(popular);
        if candidate == normalized {
            return None;
        }
        let distance = levenshtein(&normalized, &candidate);
        if distance == 0 || distance > threshold {
            continue;
        }
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((popular, distance));
        }
    }

    best.map(|(similar_to, distance)| TyposquatWarning {
        package: package.to_string(),
        similar_to: similar_to.to_string(),
        distance,
    })
}

/// One warning per suspicious dependency, in input order.
pub fn check_packages(specs: &[String]) -> Vec<TyposquatWarning> {
    specs.iter().filter_map(|s| check_typosquat(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_popular_names_pass() {
        for name in ["numpy", "pandas", "requests", "Numpy", "typing_extensions"] {
            assert!(check_typosquat(name).is_none(), "{name} flagged");
        }
    }

    #[test]
    fn test_specifiers_are_stripped() {
        assert!(check_typosquat("numpy>=1.20").is_none());
        assert!(check_typosquat("pandas[sql]>=2.0").is_none());
        assert_eq!(extract_package_name("requests~=2.28"), "requests");
        assert_eq!(extract_package_name("numpy[extra]"), "numpy");
        assert_eq!(extract_package_name("torch @ https://example.org/t.whl"), "torch");
    }

    #[test]
    fn test_lookalikes_are_flagged() {
        let warning = check_typosquat("numppy").unwrap();
        assert_eq!(warning.similar_to, "numpy");
        assert_eq!(warning.distance, 1);

        assert_eq!(check_typosquat("padas").unwrap().similar_to, "pandas");
        assert_eq!(check_typosquat("requets>=2").unwrap().package, "requets");
    }

    #[test]
    fn test_unrelated_names_pass() {
        assert!(check_typosquat("my-custom-package").is_none());
        assert!(check_typosquat("foobarqux").is_none());
        assert!(check_typosquat("").is_none());
    }

    #[test]
    fn test_check_packages_one_warning_per_offender() {
        let deps = vec![
            "numpy".to_string(),
            "numppy".to_string(),
            "padas".to_string(),
        ];
        let warnings = check_packages(&deps);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].package, "numppy");
        assert_eq!(warnings[1].similar_to, "pandas");
    }
}
