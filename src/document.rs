//! 행 → 문서 변환
//!
//! 행은 순서 있는 컬럼/값 목록 그대로 문서 필드가 되고,
//! 식별 키 컬럼 값이 `_id`가 됩니다. 값 변환은 BSON 표현으로의 무손실 매핑만 합니다.

use crate::events::{CellValue, Row};
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

/// 문서 식별 필드
pub const ID_FIELD: &str = "_id";

/// 기본 키가 없는 테이블의 식별 컬럼
pub const FALLBACK_KEY_COLUMN: &str = "id";

/// 셀 값을 BSON 값으로 변환
pub fn cell_to_bson(value: &CellValue) -> Bson {
    match value {
        CellValue::Null => Bson::Null,
        CellValue::Int8(v) => Bson::Int32(i32::from(*v)),
        CellValue::Int16(v) => Bson::Int32(i32::from(*v)),
        CellValue::Int32(v) => Bson::Int32(*v),
        CellValue::Int64(v) => Bson::Int64(*v),
        CellValue::UInt8(v) => Bson::Int32(i32::from(*v)),
        CellValue::UInt16(v) => Bson::Int32(i32::from(*v)),
        CellValue::UInt32(v) => Bson::Int64(i64::from(*v)),
        // i64 범위를 넘는 BIGINT UNSIGNED는 문자열로 보존
        CellValue::UInt64(v) => i64::try_from(*v)
            .map(Bson::Int64)
            .unwrap_or_else(|_| Bson::String(v.to_string())),
        CellValue::Float(v) => Bson::Double(f64::from(*v)),
        CellValue::Double(v) => Bson::Double(*v),
        CellValue::String(s) => Bson::String(s.clone()),
        CellValue::Bytes(b) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: b.clone(),
        }),
        CellValue::DateTime(dt) => Bson::DateTime(bson::DateTime::from_chrono(*dt)),
        CellValue::Date(s) | CellValue::Time(s) | CellValue::Decimal(s) => Bson::String(s.clone()),
        CellValue::Json(v) => bson::to_bson(v).unwrap_or_else(|_| Bson::String(v.to_string())),
    }
}

/// 행의 식별 키 추출
///
/// 단일 키는 값 그대로, 복합 키는 컬럼 순서대로 구성한 하위 문서가 됩니다.
/// 키 컬럼이 없거나 값이 NULL이면 `None`.
pub fn document_key(row: &Row, key_columns: &[String]) -> Option<Bson> {
    match key_columns {
        [] => None,
        [column] => match row.get(column) {
            Some(value) if !value.is_null() => Some(cell_to_bson(value)),
            _ => None,
        },
        columns => {
            let mut key = Document::new();
            for column in columns {
                match row.get(column) {
                    Some(value) if !value.is_null() => {
                        key.insert(column.clone(), cell_to_bson(value));
                    }
                    _ => return None,
                }
            }
            Some(Bson::Document(key))
        }
    }
}

/// `_id`를 맨 앞에 둔 전체 문서 생성
pub fn row_to_document(row: &Row, key: Bson) -> Document {
    let mut doc = Document::new();
    doc.insert(ID_FIELD, key);
    doc.extend(field_document(row));
    doc
}

/// `_id`를 제외한 필드 문서 (`$set` 본문용)
pub fn field_document(row: &Row) -> Document {
    row.iter()
        .filter(|(name, _)| *name != ID_FIELD)
        .map(|(name, value)| (name.to_string(), cell_to_bson(value)))
        .collect()
}

/// 로그 및 인메모리 인덱스용 키 표현
pub fn key_repr(key: &Bson) -> String {
    key.clone().into_relaxed_extjson().to_string()
}
