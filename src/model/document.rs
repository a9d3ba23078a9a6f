//! 文档转换相关的数据模型
//!
//! - [`ConversionRequest`]：生产者投递到队列的转换请求（只读）
//! - [`StoredFile`]：对象存储中读出/待写入的文件
//! - [`DocumentStatus`]：文档状态（封闭枚举）
//! - [`Outcome`]：流水线上报给状态接收端的终态结果

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// 转换请求消息
///
/// 由元数据服务创建并投递，流水线每次投递只消费一次，从不修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub document_id: String,
    pub source_key: String,
    pub external_reference_id: String,
    pub format: String,
}

impl ConversionRequest {
    pub fn new(
        document_id: impl Into<String>,
        source_key: impl Into<String>,
        external_reference_id: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source_key: source_key.into(),
            external_reference_id: external_reference_id.into(),
            format: format.into(),
        }
    }

    /// 从队列原始载荷解析，字段缺失或为空视为消息格式错误
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(payload)
            .map_err(|e| anyhow!("转换请求JSON解析失败: {}", e))?;
        request.validate()?;
        Ok(request)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow!("转换请求序列化失败: {}", e))
    }

    fn validate(&self) -> Result<()> {
        if self.document_id.trim().is_empty() {
            return Err(anyhow!("documentId 不能为空"));
        }
        if self.source_key.trim().is_empty() {
            return Err(anyhow!("sourceKey 不能为空"));
        }
        if self.external_reference_id.trim().is_empty() {
            return Err(anyhow!("externalReferenceId 不能为空"));
        }
        Ok(())
    }

    /// 转换后文件的存储键：`{externalReferenceId}/{documentId}.{extension}`
    pub fn converted_key(&self, target_extension: &str) -> String {
        format!(
            "{}/{}.{}",
            self.external_reference_id.trim_matches('/'),
            self.document_id,
            target_extension.trim_start_matches('.')
        )
    }

    /// 归一化后的格式提示（小写、无前导点）
    pub fn normalized_format(&self) -> String {
        normalize_format(&self.format)
    }
}

/// 对象存储中的文件
#[derive(Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub key: String,
    pub display_name: String,
    pub bytes: Vec<u8>,
    pub format: String,
    pub content_type: String,
}

impl StoredFile {
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        bytes: Vec<u8>,
        format: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            bytes,
            format: normalize_format(&format.into()),
            content_type: content_type.into(),
        }
    }

    /// 根据存储键推导显示名、格式与 Content-Type
    pub fn from_key(key: &str, bytes: Vec<u8>) -> Self {
        let display_name = key.rsplit('/').next().unwrap_or(key).to_string();
        let format = display_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        let content_type = mime_guess::from_path(&display_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self::new(key, display_name, bytes, format, content_type)
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

// 文件内容不打印
impl fmt::Debug for StoredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredFile")
            .field("key", &self.key)
            .field("display_name", &self.display_name)
            .field("size", &self.bytes.len())
            .field("format", &self.format)
            .field("content_type", &self.content_type)
            .finish()
    }
}

pub fn normalize_format(format: &str) -> String {
    format.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// 文档状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// 已创建，等待转换
    Pending,
    /// 原件已上传
    Uploaded,
    /// 转换成功，PDF 已存储
    Converted,
    /// 转换失败（被拒绝或重试耗尽后上报）
    FailedConversion,
    /// 病毒扫描未通过
    FailedVirus,
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Uploaded => "UPLOADED",
            DocumentStatus::Converted => "CONVERTED",
            DocumentStatus::FailedConversion => "FAILED_CONVERSION",
            DocumentStatus::FailedVirus => "FAILED_VIRUS",
            DocumentStatus::Deleted => "DELETED",
        }
    }

    /// 流水线只会上报这两个终态
    pub fn is_pipeline_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Converted | DocumentStatus::FailedConversion
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DocumentStatus::Pending),
            "UPLOADED" => Ok(DocumentStatus::Uploaded),
            "CONVERTED" => Ok(DocumentStatus::Converted),
            "FAILED_CONVERSION" => Ok(DocumentStatus::FailedConversion),
            "FAILED_VIRUS" => Ok(DocumentStatus::FailedVirus),
            "DELETED" => Ok(DocumentStatus::Deleted),
            other => Err(anyhow!("未知的文档状态: {}", other)),
        }
    }
}

/// 上报给状态接收端的终态结果
///
/// `converted_key` 仅在 `new_status == CONVERTED` 时存在，只能通过两个构造函数创建。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub document_id: String,
    pub new_status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_key: Option<String>,
    pub external_reference_id: String,
}

impl Outcome {
    pub fn converted(request: &ConversionRequest, converted_key: impl Into<String>) -> Self {
        Self {
            document_id: request.document_id.clone(),
            new_status: DocumentStatus::Converted,
            converted_key: Some(converted_key.into()),
            external_reference_id: request.external_reference_id.clone(),
        }
    }

    pub fn failed(request: &ConversionRequest) -> Self {
        Self {
            document_id: request.document_id.clone(),
            new_status: DocumentStatus::FailedConversion,
            converted_key: None,
            external_reference_id: request.external_reference_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ConversionRequest {
        ConversionRequest::new("D1", "ext1/D1.docx", "ext1", "docx")
    }

    #[test]
    fn test_request_wire_format() {
        let payload = br#"{"documentId":"D1","sourceKey":"ext1/D1.docx","externalReferenceId":"ext1","format":"docx"}"#;
        let request = ConversionRequest::from_payload(payload).unwrap();
        assert_eq!(request, sample_request());
    }

    #[test]
    fn test_request_rejects_missing_fields() {
        assert!(ConversionRequest::from_payload(br#"{"documentId":"D1"}"#).is_err());
        assert!(ConversionRequest::from_payload(
            br#"{"documentId":" ","sourceKey":"k","externalReferenceId":"e","format":"docx"}"#
        )
        .is_err());
        assert!(ConversionRequest::from_payload(b"not json").is_err());
    }

    #[test]
    fn test_converted_key_derivation() {
        let request = sample_request();
        assert_eq!(request.converted_key("pdf"), "ext1/D1.pdf");
        assert_eq!(request.converted_key(".pdf"), "ext1/D1.pdf");
    }

    #[test]
    fn test_stored_file_from_key() {
        let file = StoredFile::from_key("ext1/Report.DOCX", vec![1, 2, 3]);
        assert_eq!(file.display_name, "Report.DOCX");
        assert_eq!(file.format, "docx");
        assert_eq!(
            file.content_type,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(file.size(), 3);
        assert!(!format!("{:?}", file).contains("[1, 2, 3]"));
    }

    #[test]
    fn test_status_round_trip_names() {
        assert_eq!(
            serde_json::to_string(&DocumentStatus::FailedConversion).unwrap(),
            "\"FAILED_CONVERSION\""
        );
        assert_eq!(
            "converted".parse::<DocumentStatus>().unwrap(),
            DocumentStatus::Converted
        );
        assert!("SHREDDED".parse::<DocumentStatus>().is_err());
        assert!(DocumentStatus::Converted.is_pipeline_terminal());
        assert!(!DocumentStatus::Deleted.is_pipeline_terminal());
    }

    #[test]
    fn test_outcome_shapes() {
        let request = sample_request();
        let converted = Outcome::converted(&request, "ext1/D1.pdf");
        let json = serde_json::to_value(&converted).unwrap();
        assert_eq!(json["newStatus"], "CONVERTED");
        assert_eq!(json["convertedKey"], "ext1/D1.pdf");
        assert_eq!(json["externalReferenceId"], "ext1");

        let failed = Outcome::failed(&request);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["newStatus"], "FAILED_CONVERSION");
        assert!(json.get("convertedKey").is_none());
    }
}
