//! Typed - 型付き Operation API
//!
//! Coordinator は bytes しか扱わない。このモジュールはリクエスト/結果の型と
//! operation の対応を静的に保証し、bytes との変換をまとめて引き受けます。
//!
//! # 二層構造
//! - **表層（Typed）**: `Request` trait, `Operation<R>` trait - 型安全
//! - **内部（Dyn）**: `DynOperation` trait - object-safe, type erasure

pub mod codec;
pub mod operation;
pub mod request;

pub use self::codec::{CodecError, JsonCodec};
pub use self::operation::{
    AttemptContext, DynOperation, Operation, OperationError, Rejection, TypedOperation,
};
pub use self::request::Request;
