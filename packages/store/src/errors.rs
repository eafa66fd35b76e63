cleat_error::define_errors! {
	#[group("store")]
	pub enum Store {
		#[status(409)]
		#[error(
			"stale_generation",
			"Write rejected by a newer actor generation.",
			"Write for actor '{actor_id}' rejected, generation no longer current."
		)]
		StaleGeneration { actor_id: String },

		#[status(409)]
		#[error("database_closed", "The actor's database has been closed.")]
		DatabaseClosed,
	}
}
