/*!
    Position of the drive's values in the slave's process image.

    The layout follows the PDO mappings in [crate::sdo::objects]: entries are packed in mapping order without padding, little endian. A drive with a different mapping only needs a different [ProcessLayout].
*/

use crate::{
    data::{Field, PackingResult},
    cia402::ControlwordCommand,
    };


/// fields of a drive's outputs (RxPDO) and inputs (TxPDO) in its process image
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProcessLayout {
    // outputs
    pub controlword: Field<u16>,
    pub mode: Field<i8>,
    pub target_torque: Field<i16>,
    pub target_position: Field<i32>,
    // inputs
    pub statusword: Field<u16>,
    pub mode_display: Field<i8>,
    pub position: Field<i32>,
    pub torque: Field<i16>,
    /// actual velocity, most drives do not map it by default
    pub velocity: Option<Field<i32>>,
}

impl Default for ProcessLayout {
    fn default() -> Self {
        Self {
            controlword: Field::simple(0),
            mode: Field::simple(2),
            target_torque: Field::simple(3),
            target_position: Field::simple(5),

            statusword: Field::simple(0),
            mode_display: Field::simple(2),
            position: Field::simple(3),
            torque: Field::simple(7),
            velocity: None,
        }
    }
}

impl ProcessLayout {
    /// output bytes covered by the layout
    pub fn output_len(&self) -> usize {
        [self.controlword.end(), self.mode.end(), self.target_torque.end(), self.target_position.end()]
            .into_iter().max().unwrap_or(0)
    }
    /// input bytes covered by the layout
    pub fn input_len(&self) -> usize {
        [self.statusword.end(), self.mode_display.end(), self.position.end(), self.torque.end(),
            self.velocity.map_or(0, |field| field.end())]
            .into_iter().max().unwrap_or(0)
    }

    /**
        put the outputs in a state that cannot move the motor: everything zeroed but the mode, and the controlword set to [ControlwordCommand::Shutdown]

        Only the bytes of the layout that fit in `outputs` are touched. The controlword is mandatory, the mode is skipped when the image is too small to hold it.
    */
    pub fn init_safe_outputs(&self, outputs: &mut [u8], mode: i8) -> PackingResult<()> {
        let end = self.output_len().min(outputs.len());
        outputs[.. end].fill(0);
        self.controlword.set(outputs, ControlwordCommand::Shutdown.bits())?;
        if self.mode.end() <= outputs.len() {
            self.mode.set(outputs, mode)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_sizes() {
        let layout = ProcessLayout::default();
        assert_eq!(layout.output_len(), 9);
        assert_eq!(layout.input_len(), 9);
        let layout = ProcessLayout {velocity: Some(Field::simple(9)), .. layout};
        assert_eq!(layout.input_len(), 13);
    }

    #[test]
    fn safe_outputs() {
        let layout = ProcessLayout::default();
        let mut outputs = [0xffu8; 12];
        layout.init_safe_outputs(&mut outputs, 4).unwrap();
        assert_eq!(outputs, [0x06, 0, 4, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn safe_outputs_in_minimal_image() {
        let layout = ProcessLayout::default();
        let mut outputs = [0xffu8; 2];
        layout.init_safe_outputs(&mut outputs, 4).unwrap();
        assert_eq!(outputs, [0x06, 0]);
        assert!(layout.init_safe_outputs(&mut [0xff], 4).is_err());
    }
}
