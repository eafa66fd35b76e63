/// Declares error enums in the runtime taxonomy.
///
/// Each variant carries a wire code and a client-safe message; an optional
/// third literal is an operator-facing message formatted with the variant's
/// fields. HTTP status defaults to 400 and is overridden with `#[status(..)]`.
///
/// ```
/// cleat_error::define_errors! {
/// 	#[group("actor")]
/// 	pub enum Actor {
/// 		#[status(404)]
/// 		#[error("not_found", "The actor does not exist.")]
/// 		NotFound,
/// 	}
/// }
/// ```
#[macro_export]
macro_rules! define_errors {
	($(
		#[group($group:literal)]
		$(#[$meta:meta])*
		pub enum $name:ident {
			$(
				$(#[status($status:literal)])?
				#[error($code:literal, $msg:literal $(, $imsg:literal)?)]
				$variant:ident $({ $($field:ident : $ty:ty),+ $(,)? })?,
			)+
		}
	)+) => {$(
		$(#[$meta])*
		#[derive(Debug, Clone)]
		pub enum $name {
			$(
				$variant $({ $($field: $ty),+ })?,
			)+
		}

		impl $crate::ErrorParts for $name {
			fn group(&self) -> &'static str {
				$group
			}

			fn code(&self) -> &'static str {
				match self {
					$(Self::$variant { .. } => $code,)+
				}
			}

			fn status(&self) -> u16 {
				match self {
					$(Self::$variant { .. } => $crate::__status_or_default!($($status)?),)+
				}
			}

			fn message(&self) -> String {
				match self {
					$(Self::$variant { .. } => ($msg).to_string(),)+
				}
			}

			fn internal_message(&self) -> Option<String> {
				match self {
					$(
						Self::$variant $({ $($field),+ })? => {
							$crate::__internal_message!($($imsg)? $(; $($field),+)?)
						}
					)+
				}
			}
		}

		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				write!(
					f,
					"{}.{}",
					$crate::ErrorParts::group(self),
					$crate::ErrorParts::code(self)
				)
			}
		}

		impl std::error::Error for $name {}
	)+};
}

#[macro_export]
#[doc(hidden)]
macro_rules! __status_or_default {
	() => {
		400
	};
	($status:literal) => {
		$status
	};
}

#[macro_export]
#[doc(hidden)]
macro_rules! __internal_message {
	() => {
		None
	};
	($imsg:literal) => {
		Some(($imsg).to_string())
	};
	(; $($field:ident),+) => {{
		$(let _ = $field;)+
		None
	}};
	($imsg:literal ; $($field:ident),+) => {
		Some(format!($imsg, $($field = $field),+))
	};
}
