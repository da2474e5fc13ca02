use clap::Parser;
use tempfile::TempDir;

use sam_seg::{Config, ErrorKind, ExecutionDevice, OrtSamModel, StatusClass};

#[test]
fn test_missing_weights_fail_before_any_session() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::try_parse_from([
        "sam-seg",
        "--model-dir",
        temp_dir.path().to_str().unwrap(),
        "--bucket-name",
        "masks",
    ])
    .unwrap();

    let err = match OrtSamModel::load(&config.model_config(), ExecutionDevice::Cpu) {
        Ok(_) => panic!("loading from an empty directory must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert_eq!(err.kind().status_class(), StatusClass::ServerFault);
    assert!(err.report().contains("vision_encoder.onnx"));
}

#[test]
fn test_missing_decoder_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("vision_encoder.onnx"), b"dummy_model").unwrap();
    let config = Config::try_parse_from([
        "sam-seg",
        "--model-dir",
        temp_dir.path().to_str().unwrap(),
        "--storage-url",
        "memory://masks",
    ])
    .unwrap();

    let err = match OrtSamModel::load(&config.model_config(), ExecutionDevice::Cpu) {
        Ok(_) => panic!("decoder file is missing"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert!(err.report().contains("prompt_encoder_mask_decoder.onnx"));
}
